//! `procrastinate-core`: job queue domain building blocks.
//!
//! Pure types shared by every other crate: identifiers, the job status
//! machine, notification payloads, retry strategies and the clock. Nothing
//! here performs I/O.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod task_error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use id::{JobId, WorkerId};
pub use job::{
    DEFAULT_PRIORITY, DEFAULT_QUEUE, DeleteJobCondition, EventType, Job, JobArgs, JobCounts,
    JobStatus, NewJob, Notification,
};
pub use retry::{RetryDecision, RetryPolicy, RetryStrategy, RetryValue};
pub use task_error::TaskError;
