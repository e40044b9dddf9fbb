pub mod handlers;
pub mod orchestrator;
pub mod record;
pub mod runtime;

pub use handlers::Services;
pub use orchestrator::TaskOrchestrator;
pub use record::{TaskInfo, TaskKind, TaskRecord, TaskStatus, TaskUpdate};
pub use runtime::{RuntimeRegistry, TaskContext, TaskError, WorkerPool, WorkerPoolConfig};
