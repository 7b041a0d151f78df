//! Administration shell: listing, cancelling and retrying jobs.

use std::io::Write;

use anyhow::{Context, bail};
use chrono::{SubsecRound, Utc};
use procrastinate_core::{Job, JobCounts, JobId, RetryDecision};
use procrastinate_infra::{JobFilter, JobManager};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const INTRO: &str = "Welcome to the procrastinate shell.   Type help or ? to list commands.";
const PROMPT: &str = "procrastinate> ";

const HELP: &str = "\
Commands:
  list_jobs [id=ID] [queue=QUEUE] [task=TASK] [status=STATUS] [lock=LOCK] [queueing_lock=QL] [details]
  list_queues [queue=QUEUE] [task=TASK] [status=STATUS] [lock=LOCK]
  list_tasks [queue=QUEUE] [task=TASK] [status=STATUS] [lock=LOCK]
  list_locks [queue=QUEUE] [task=TASK] [status=STATUS] [lock=LOCK]
  status JOB_ID       print the status of a job
  cancel JOB_ID       cancel a waiting job
  retry JOB_ID        put a job back in the queue
  help                show this message
  exit                leave the shell";

pub struct Shell {
    manager: JobManager,
}

impl Shell {
    pub fn new(manager: JobManager) -> Self {
        Self { manager }
    }

    /// Read commands from `input` until `exit` or end of input. A failing
    /// command prints its error and the loop goes on.
    pub async fn run<R, W>(&self, input: R, out: &mut W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        writeln!(out, "{INTRO}")?;
        let mut lines = input.lines();
        loop {
            write!(out, "{PROMPT}")?;
            out.flush()?;
            let Some(line) = lines.next_line().await? else {
                writeln!(out)?;
                return Ok(());
            };
            match self.execute(&line, out).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => writeln!(out, "Error: {e:#}")?,
            }
        }
    }

    /// Run one command line. Returns `true` when the shell should exit.
    pub async fn execute<W: Write>(&self, line: &str, out: &mut W) -> anyhow::Result<bool> {
        let line = line.trim();
        let (command, arg) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        match command {
            "" => {}
            "exit" | "EOF" => return Ok(true),
            "help" | "?" => writeln!(out, "{HELP}")?,
            "list_jobs" => self.list_jobs(arg, out).await?,
            "list_queues" => {
                let counts = self.manager.list_queues(&parse_filter(arg)?).await?;
                print_counts(&counts, out)?;
            }
            "list_tasks" => {
                let counts = self.manager.list_tasks(&parse_filter(arg)?).await?;
                print_counts(&counts, out)?;
            }
            "list_locks" => {
                let counts = self.manager.list_locks(&parse_filter(arg)?).await?;
                print_counts(&counts, out)?;
            }
            "status" => {
                let job_id = parse_job_id(arg)?;
                let status = self.manager.get_job_status(job_id).await?;
                writeln!(out, "#{job_id} - [{status}]")?;
            }
            "cancel" => {
                let job_id = parse_job_id(arg)?;
                if !self.manager.cancel_job_by_id(job_id, false, false).await? {
                    writeln!(out, "Job #{job_id} is not waiting, it was not cancelled")?;
                }
                self.print_one(job_id, out).await?;
            }
            "retry" => {
                let job_id = parse_job_id(arg)?;
                let decision = RetryDecision::at(Utc::now().trunc_subsecs(0));
                self.manager.retry_job_by_id(job_id, decision).await?;
                self.print_one(job_id, out).await?;
            }
            other => writeln!(out, "*** Unknown syntax: {other}")?,
        }
        Ok(false)
    }

    async fn list_jobs<W: Write>(&self, arg: &str, out: &mut W) -> anyhow::Result<()> {
        let details = arg.split_whitespace().any(|word| word == "details");
        let rest: Vec<&str> = arg.split_whitespace().filter(|word| *word != "details").collect();
        let filter = parse_filter(&rest.join(" "))?;
        for job in self.manager.list_jobs(&filter).await? {
            print_job(&job, details, out)?;
        }
        Ok(())
    }

    async fn print_one<W: Write>(&self, job_id: JobId, out: &mut W) -> anyhow::Result<()> {
        let jobs = self.manager.list_jobs(&JobFilter::new().with_id(job_id)).await?;
        match jobs.first() {
            Some(job) => print_job(job, false, out),
            None => bail!("job #{job_id} not found"),
        }
    }
}

/// `key=value` words into a filter; unknown keys are rejected.
fn parse_filter(arg: &str) -> anyhow::Result<JobFilter> {
    let mut filter = JobFilter::new();
    for word in arg.split_whitespace() {
        let (key, value) = word.split_once('=').unwrap_or((word, ""));
        filter = match key {
            "id" => filter.with_id(parse_job_id(value)?),
            "queue" => filter.with_queue(value),
            "task" => filter.with_task(value),
            "status" => filter.with_status(value.parse()?),
            "lock" => filter.with_lock(value),
            "queueing_lock" => filter.with_queueing_lock(value),
            other => bail!("unknown filter {other:?}"),
        };
    }
    Ok(filter)
}

fn parse_job_id(arg: &str) -> anyhow::Result<JobId> {
    let id: i64 = arg
        .trim()
        .parse()
        .with_context(|| format!("invalid job id {:?}", arg.trim()))?;
    Ok(JobId::from_i64(id))
}

fn print_job<W: Write>(job: &Job, details: bool, out: &mut W) -> anyhow::Result<()> {
    write!(
        out,
        "#{} {} on {} - [{}]",
        job.id, job.task_name, job.queue, job.status
    )?;
    if details {
        let scheduled_at = job
            .scheduled_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "None".to_string());
        write!(
            out,
            " (attempts={}, priority={}, scheduled_at={scheduled_at}, args={}, lock={})",
            job.attempts,
            job.priority,
            serde_json::Value::Object(job.task_kwargs.clone()),
            job.lock.as_deref().unwrap_or("None"),
        )?;
    }
    writeln!(out)?;
    Ok(())
}

fn print_counts<W: Write>(counts: &[JobCounts], out: &mut W) -> anyhow::Result<()> {
    for count in counts {
        writeln!(
            out,
            "{}: {} jobs (todo: {}, doing: {}, succeeded: {}, failed: {}, cancelled: {}, aborted: {})",
            count.name,
            count.jobs_count,
            count.todo,
            count.doing,
            count.succeeded,
            count.failed,
            count.cancelled,
            count.aborted,
        )?;
    }
    Ok(())
}
