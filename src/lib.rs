pub mod chat_source;
pub mod config;
pub mod detector;
pub mod entry_engine;
pub mod errors;
pub mod exchange_gateway;
pub mod hedge_manager;
pub mod ingestion;
pub mod lifecycle_manager;
pub mod lifecycle_store;
pub mod position_lock;
pub mod publisher;
pub mod pyramid_manager;
pub mod quantize;
pub mod signal_store;
pub mod telemetry;
pub mod types;
pub mod watchdog;
