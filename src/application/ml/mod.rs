// Model training and inference backends
pub mod forest;
