//! Query catalog.
//!
//! Every statement the job manager sends goes through one of these
//! constants. The `name` is what the in-memory connector dispatches on; the
//! `sql` is what the PostgreSQL connector runs. Parameters are positional
//! and documented on each constant in bind order.

/// A named SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub name: &'static str,
    pub sql: &'static str,
}

macro_rules! job_columns {
    () => {
        "id, queue_name, task_name, priority, lock, queueing_lock, args, \
         status::text AS status, scheduled_at, attempts, abort_requested, worker_id"
    };
}

macro_rules! prefixed_job_columns {
    () => {
        "jobs.id, jobs.queue_name, jobs.task_name, jobs.priority, jobs.lock, \
         jobs.queueing_lock, jobs.args, jobs.status::text AS status, jobs.scheduled_at, \
         jobs.attempts, jobs.abort_requested, jobs.worker_id"
    };
}

/// `$1` queue, `$2` task, `$3` priority, `$4` lock, `$5` queueing lock,
/// `$6` args, `$7` scheduled_at. Returns `id`.
pub const DEFER_JOB: Query = Query {
    name: "defer_job",
    sql: r#"
        SELECT procrastinate_defer_job_v1($1::varchar, $2::varchar, $3::integer, $4::text, $5::text, $6::jsonb, $7::timestamptz) AS id
    "#,
};

/// `$1` queue, `$2` lock, `$3` queueing lock, `$4` task, `$5` priority,
/// `$6` periodic id, `$7` defer timestamp, `$8` args. Returns `id` (null when
/// this tick was already deferred).
pub const DEFER_PERIODIC_JOB: Query = Query {
    name: "defer_periodic_job",
    sql: r#"
        SELECT procrastinate_defer_periodic_job_v1($1::varchar, $2::varchar, $3::varchar, $4::varchar, $5::integer, $6::varchar, $7::bigint, $8::jsonb) AS id
    "#,
};

/// `$1` queues (null = all), `$2` worker id. Returns a job row with a null
/// `id` when nothing is eligible.
pub const FETCH_JOB: Query = Query {
    name: "fetch_job",
    sql: concat!(
        "SELECT ",
        job_columns!(),
        " FROM procrastinate_fetch_job_v1($1::varchar[], $2::bigint)"
    ),
};

/// `$1` job id, `$2` status, `$3` delete.
pub const FINISH_JOB: Query = Query {
    name: "finish_job",
    sql: r#"
        SELECT procrastinate_finish_job_v1($1::bigint, $2::procrastinate_job_status, $3::boolean)
    "#,
};

/// `$1` job id, `$2` retry_at, `$3` new priority, `$4` new queue, `$5` new lock.
/// Returns the job's new `status`: `todo`, or `failed` when its queueing
/// lock was taken in the meantime.
pub const RETRY_JOB: Query = Query {
    name: "retry_job",
    sql: r#"
        SELECT procrastinate_retry_job_v1($1::bigint, $2::timestamptz, $3::integer, $4::varchar, $5::varchar)::text AS status
    "#,
};

/// `$1` job id, `$2` abort, `$3` delete. Returns `id` (null when nothing
/// was cancelled).
pub const CANCEL_JOB: Query = Query {
    name: "cancel_job",
    sql: r#"
        SELECT procrastinate_cancel_job_v1($1::bigint, $2::boolean, $3::boolean) AS id
    "#,
};

/// `$1` job id. Returns `status`.
pub const GET_JOB_STATUS: Query = Query {
    name: "get_job_status",
    sql: r#"
        SELECT status::text AS status FROM procrastinate_jobs WHERE id = $1::bigint
    "#,
};

/// Returns a row when the jobs table exists.
pub const CHECK_CONNECTION: Query = Query {
    name: "check_connection",
    sql: r#"
        SELECT TRUE AS check FROM pg_catalog.pg_tables WHERE tablename = 'procrastinate_jobs'
    "#,
};

/// `$1` id, `$2` queue, `$3` task, `$4` status, `$5` lock, `$6` queueing lock.
/// Every filter is optional.
pub const LIST_JOBS: Query = Query {
    name: "list_jobs",
    sql: concat!(
        "SELECT ",
        job_columns!(),
        r#"
        FROM procrastinate_jobs
        WHERE ($1::bigint IS NULL OR id = $1)
            AND ($2::varchar IS NULL OR queue_name = $2)
            AND ($3::varchar IS NULL OR task_name = $3)
            AND ($4::text IS NULL OR status::text = $4)
            AND ($5::text IS NULL OR lock = $5)
            AND ($6::text IS NULL OR queueing_lock = $6)
        ORDER BY id ASC
        "#
    ),
};

/// `$1` queue, `$2` task, `$3` status, `$4` lock. Returns one row per
/// `(name, status)` with `count`.
pub const LIST_QUEUES: Query = Query {
    name: "list_queues",
    sql: r#"
        SELECT queue_name AS name, status::text AS status, COUNT(*) AS count
        FROM procrastinate_jobs
        WHERE ($1::varchar IS NULL OR queue_name = $1)
            AND ($2::varchar IS NULL OR task_name = $2)
            AND ($3::text IS NULL OR status::text = $3)
            AND ($4::text IS NULL OR lock = $4)
        GROUP BY queue_name, status
        ORDER BY queue_name, status
    "#,
};

/// Same filters and shape as [`LIST_QUEUES`], grouped by task.
pub const LIST_TASKS: Query = Query {
    name: "list_tasks",
    sql: r#"
        SELECT task_name AS name, status::text AS status, COUNT(*) AS count
        FROM procrastinate_jobs
        WHERE ($1::varchar IS NULL OR queue_name = $1)
            AND ($2::varchar IS NULL OR task_name = $2)
            AND ($3::text IS NULL OR status::text = $3)
            AND ($4::text IS NULL OR lock = $4)
        GROUP BY task_name, status
        ORDER BY task_name, status
    "#,
};

/// Same filters and shape as [`LIST_QUEUES`], grouped by non-null lock.
pub const LIST_LOCKS: Query = Query {
    name: "list_locks",
    sql: r#"
        SELECT lock AS name, status::text AS status, COUNT(*) AS count
        FROM procrastinate_jobs
        WHERE lock IS NOT NULL
            AND ($1::varchar IS NULL OR queue_name = $1)
            AND ($2::varchar IS NULL OR task_name = $2)
            AND ($3::text IS NULL OR status::text = $3)
            AND ($4::text IS NULL OR lock = $4)
        GROUP BY lock, status
        ORDER BY lock, status
    "#,
};

/// `$1` queue (optional). Returns `id` of running jobs with a pending abort.
pub const LIST_JOBS_TO_ABORT: Query = Query {
    name: "list_jobs_to_abort",
    sql: r#"
        SELECT id FROM procrastinate_jobs
        WHERE status = 'doing'
            AND abort_requested
            AND ($1::varchar IS NULL OR queue_name = $1)
        ORDER BY id
    "#,
};

/// `$1` hours, `$2` queue, `$3` statuses. Returns `deleted` count.
pub const DELETE_OLD_JOBS: Query = Query {
    name: "delete_old_jobs",
    sql: r#"
        WITH deleted AS (
            DELETE FROM procrastinate_jobs
            WHERE id IN (
                SELECT jobs.id
                FROM procrastinate_jobs AS jobs
                LEFT JOIN procrastinate_events AS events ON events.job_id = jobs.id
                WHERE jobs.status::text = ANY($3::text[])
                    AND ($2::varchar IS NULL OR jobs.queue_name = $2)
                GROUP BY jobs.id
                HAVING MAX(events.at) < NOW() - make_interval(hours => $1::integer)
            )
            RETURNING id
        )
        SELECT COUNT(*) AS deleted FROM deleted
    "#,
};

/// `$1` seconds since started, `$2` queue, `$3` task.
pub const SELECT_STALLED_JOBS_BY_STARTED: Query = Query {
    name: "select_stalled_jobs_by_started",
    sql: concat!(
        "SELECT ",
        prefixed_job_columns!(),
        r#"
        FROM procrastinate_jobs AS jobs
        JOIN procrastinate_events AS events ON events.job_id = jobs.id
        WHERE jobs.status = 'doing'
            AND events.type = 'started'
            AND ($2::varchar IS NULL OR jobs.queue_name = $2)
            AND ($3::varchar IS NULL OR jobs.task_name = $3)
        GROUP BY jobs.id
        HAVING MAX(events.at) < NOW() - make_interval(secs => $1::float8)
        ORDER BY jobs.id
        "#
    ),
};

/// `$1` seconds since heartbeat, `$2` queue, `$3` task.
pub const SELECT_STALLED_JOBS_BY_HEARTBEAT: Query = Query {
    name: "select_stalled_jobs_by_heartbeat",
    sql: concat!(
        "SELECT ",
        prefixed_job_columns!(),
        r#"
        FROM procrastinate_jobs AS jobs
        WHERE jobs.status = 'doing'
            AND jobs.heartbeat_updated_at < NOW() - make_interval(secs => $1::float8)
            AND ($2::varchar IS NULL OR jobs.queue_name = $2)
            AND ($3::varchar IS NULL OR jobs.task_name = $3)
        ORDER BY jobs.id
        "#
    ),
};

/// Returns `worker_id`.
pub const REGISTER_WORKER: Query = Query {
    name: "register_worker",
    sql: r#"
        SELECT worker_id FROM procrastinate_register_worker_v1()
    "#,
};

/// `$1` worker id.
pub const UNREGISTER_WORKER: Query = Query {
    name: "unregister_worker",
    sql: r#"
        SELECT procrastinate_unregister_worker_v1($1::bigint)
    "#,
};

/// `$1` worker id.
pub const UPDATE_HEARTBEAT: Query = Query {
    name: "update_heartbeat",
    sql: r#"
        SELECT procrastinate_update_heartbeat_v1($1::bigint)
    "#,
};

/// `$1` seconds since heartbeat. Returns `worker_id` of pruned workers.
pub const PRUNE_STALLED_WORKERS: Query = Query {
    name: "prune_stalled_workers",
    sql: r#"
        SELECT worker_id FROM procrastinate_prune_stalled_workers_v1($1::float8)
    "#,
};

/// Every statement in the catalog.
pub const ALL: &[Query] = &[
    DEFER_JOB,
    DEFER_PERIODIC_JOB,
    FETCH_JOB,
    FINISH_JOB,
    RETRY_JOB,
    CANCEL_JOB,
    GET_JOB_STATUS,
    CHECK_CONNECTION,
    LIST_JOBS,
    LIST_QUEUES,
    LIST_TASKS,
    LIST_LOCKS,
    LIST_JOBS_TO_ABORT,
    DELETE_OLD_JOBS,
    SELECT_STALLED_JOBS_BY_STARTED,
    SELECT_STALLED_JOBS_BY_HEARTBEAT,
    REGISTER_WORKER,
    UNREGISTER_WORKER,
    UPDATE_HEARTBEAT,
    PRUNE_STALLED_WORKERS,
];
