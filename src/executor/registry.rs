use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Lifecycle of a job.
///
/// `Running` is the only state observable inside the registry (plus
/// `Killed` once a stop was requested); terminal states are reported
/// by the executor after the entry has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    TimedOut,
    Killed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Killed => "killed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A running job as tracked by the registry.
///
/// The process handle itself stays with the task awaiting it; the
/// registry only keeps `stop`, used to ask that task to terminate
/// the process.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
    stop: Arc<Notify>,
}

/// Serializable view of a running job (`GET /jobs`).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobSummary {
    pub id: u64,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
}

struct Inner {
    next_id: u64,
    jobs: HashMap<u64, Job>,
    /// Set by `request_stop_all`; later registrations start stopped
    closed: bool,
}

/// Concurrency-safe map of job id → running job.
///
/// All mutations (id allocation + insert, stop lookup, removal) go
/// through one mutex, and the lock is never held across an `.await`.
/// An entry exists iff its process is currently being waited on.
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                jobs: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocates the next id and inserts a `Running` job.
    ///
    /// Returns the id and the handle the waiting task listens on for
    /// stop requests. Once the registry is closed the job is inserted
    /// as `Killed` with its stop already requested.
    pub fn register(&self, command: &str, pid: Option<u32>) -> (u64, Arc<Notify>) {
        let stop = Arc::new(Notify::new());
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let status = if inner.closed {
            stop.notify_one();
            JobStatus::Killed
        } else {
            JobStatus::Running
        };
        inner.jobs.insert(
            id,
            Job {
                id,
                command: command.to_string(),
                pid,
                started_at: Utc::now(),
                status,
                stop: Arc::clone(&stop),
            },
        );
        (id, stop)
    }

    /// Marks the job as `Killed` and wakes its waiting task.
    ///
    /// Returns false if no such job is registered (never issued, or
    /// already removed by whichever path observed completion first).
    pub fn request_stop(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Killed;
                // notify_one stores a permit, so a request sent before the
                // waiter reaches its select is not lost.
                job.stop.notify_one();
                true
            }
            None => false,
        }
    }

    /// Requests a stop for every registered job and closes the registry.
    ///
    /// Returns the ids that were signalled.
    pub fn request_stop_all(&self) -> Vec<u64> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let mut ids: Vec<u64> = inner
            .jobs
            .values_mut()
            .map(|job| {
                job.status = JobStatus::Killed;
                job.stop.notify_one();
                job.id
            })
            .collect();
        drop(inner);
        ids.sort_unstable();
        ids
    }

    /// Removes the job. Only the first caller for a given id gets `Some`.
    pub fn deregister(&self, id: u64) -> Option<Job> {
        self.inner.lock().jobs.remove(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().jobs.contains_key(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of running jobs, ordered by id.
    pub fn snapshot(&self) -> Vec<JobSummary> {
        let inner = self.inner.lock();
        let mut jobs: Vec<JobSummary> = inner
            .jobs
            .values()
            .map(|job| JobSummary {
                id: job.id,
                command: job.command.clone(),
                pid: job.pid,
                started_at: job.started_at,
                status: job.status,
            })
            .collect();
        drop(inner);
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
