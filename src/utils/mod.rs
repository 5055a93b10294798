pub mod logger;
pub mod security;
pub mod performance;

pub use logger::setup_logging;
pub use performance::{PerformanceConfig, PerformanceMonitor};
pub use security::SecurityManager;
