pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod http;
pub mod kv_store;
pub mod queue_bus;
pub mod scheduler;
pub mod state_machine;
pub mod task_store;
pub mod transfer;
pub mod ui_channel;
pub mod utils;

pub use clock::{ClockSource, SystemClock};
pub use config::{Config, SharedConfig};
pub use coordinator::InstanceCoordinator;
pub use error::{OrchestratorError, Result};
pub use kv_store::{KVStore, SharedKVStore};
pub use queue_bus::QueueBus;
pub use scheduler::Scheduler;
pub use task_store::{SharedTaskStore, Task, TaskStatus};
pub use ui_channel::{UIChannel, UiUpdateScheduler};
pub use utils::{setup_logging, PerformanceMonitor, SecurityManager};
