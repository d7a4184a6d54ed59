pub mod context;
pub mod effector;
pub mod engine;
pub mod invocation;
pub mod queue;
pub mod store;
pub mod task;

pub use context::TaskContext;
pub use effector::{Effector, EffectorBody, EffectorInvocation, InvocationOptions, ParameterType};
pub use engine::{TaskEngine, TaskHandle};
pub use invocation::{invocation_parallel, invocation_sequential, invoke};
pub use task::{TaskBuilder, TaskId, TaskRecord, TaskStatus, TaskSummary};
