pub mod executor;
pub mod orchestrator;
pub mod pool;
pub mod results;
pub mod retry;
pub mod scheduler;
pub mod task;

// Re-export common types
pub use executor::{BrowserExecutor, ExecutionContext, TaskExecutor};
pub use orchestrator::{Collaborators, Orchestrator, OrchestratorStats, SystemHealth};
pub use pool::{PoolStats, WorkerPool};
pub use results::ResultStore;
pub use retry::RetryPolicy;
pub use scheduler::{SchedulerStats, TaskScheduler};
pub use task::{BatchResult, Priority, Task, TaskConfig, TaskResult, TaskStatus, TaskType};
