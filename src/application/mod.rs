// Live session bundle
pub mod session;

// Keyed single-flight session registry
pub mod session_cache;

// Interval-driven refresh tasks
pub mod scheduler;

// Model training
pub mod ml;
