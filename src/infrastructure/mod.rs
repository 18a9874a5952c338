// Exchange adapters
pub mod binance;

// Shared infrastructure building blocks
pub mod core;

pub mod artifact_store;
pub mod event_bus;
pub mod mock;
pub mod prediction_log;

pub use event_bus::EventBus;
