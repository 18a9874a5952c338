// Core market and session types
pub mod types;

// Domain-specific error types
pub mod errors;

// Min-max channel normalization
pub mod normalizer;

// Bounded rolling bar history
pub mod series;

// Window/label construction for training and inference
pub mod features;

// Port interfaces
pub mod ports;

// Engine output events
pub mod events;
