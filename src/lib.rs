pub mod api;
pub mod checkpoint;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod kasa;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod scheduler;

// Re-export commonly used items
pub use config::Config;
pub use error::{AppError, Result};
pub use monitor::{DeviceIdentity, DutyCycleMonitor, InstantaneousReading, MonitorState};
pub use registry::DeviceRegistry;
pub use scheduler::CollectionScheduler;
