//! Tasks registered on every app.

use serde::Deserialize;

use crate::manager::{JobManager, OldJobs};
use crate::tasks::Task;

/// Deletes finished jobs older than `max_hours`.
pub const REMOVE_OLD_JOBS: &str = "builtin:procrastinate.builtin_tasks.remove_old_jobs";

/// Arguments of [`REMOVE_OLD_JOBS`].
#[derive(Debug, Clone, Deserialize)]
pub struct RemoveOldJobsArgs {
    /// Jobs whose last event is older than this are removed
    pub max_hours: i32,
    /// Only remove jobs of this queue
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub remove_failed: bool,
    #[serde(default)]
    pub remove_cancelled: bool,
    #[serde(default)]
    pub remove_aborted: bool,
}

/// The `remove_old_jobs` task, acting through `manager`. Returns the number
/// of deleted jobs.
pub fn remove_old_jobs(manager: JobManager) -> Task {
    Task::new(REMOVE_OLD_JOBS, move |args: RemoveOldJobsArgs| {
        let manager = manager.clone();
        async move {
            let which = OldJobs {
                include_failed: args.remove_failed,
                include_cancelled: args.remove_cancelled,
                include_aborted: args.remove_aborted,
            };
            manager
                .delete_old_jobs(args.max_hours, args.queue.as_deref(), which)
                .await
                .map_err(anyhow::Error::from)
        }
    })
}
