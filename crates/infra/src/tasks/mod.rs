//! Tasks: callables, their execution context and their registries.

pub mod blueprint;
pub mod context;
pub mod task;

pub use blueprint::Blueprint;
pub use context::{AbortReason, AbortSignal, JobContext};
pub use task::{JobDeferrer, Middleware, Next, Task, TaskResult, args_to_map, parse_args};
