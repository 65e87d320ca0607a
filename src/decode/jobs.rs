// # Decode Jobs
//
// Every spawned decode task is registered under the owner that started it
// (one ingestion run). Releasing an owner aborts its tasks; since the
// subprocesses are spawned with `kill_on_drop`, aborting the task kills the
// child.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;
use uuid::Uuid;

/// Who a decode task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOwner {
    /// One run of the ingest pipeline
    Ingest(Uuid),
    /// One scrub preview generation
    Preview(Uuid),
}

impl JobOwner {
    pub fn new_ingest() -> Self {
        JobOwner::Ingest(Uuid::new_v4())
    }

    pub fn new_preview() -> Self {
        JobOwner::Preview(Uuid::new_v4())
    }
}

type JobTable = HashMap<JobOwner, Vec<AbortHandle>>;

#[derive(Clone, Default)]
pub struct DecodeJobs {
    table: Arc<Mutex<JobTable>>,
}

impl DecodeJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `fut` and register it under `owner`
    pub fn spawn<F>(&self, owner: JobOwner, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut table = self.lock_table();
        let jobs = table.entry(owner).or_default();
        jobs.retain(|job| !job.is_finished());
        jobs.push(handle.abort_handle());
        handle
    }

    /// Abort every task of `owner`, returning how many were still running
    pub fn release(&self, owner: JobOwner) -> usize {
        let jobs = self.lock_table().remove(&owner).unwrap_or_default();
        abort_all(jobs)
    }

    /// Abort every ingestion task, used before a new media load
    pub fn release_ingestions(&self) -> usize {
        let jobs: Vec<AbortHandle> = {
            let mut table = self.lock_table();
            let owners: Vec<JobOwner> = table
                .keys()
                .filter(|owner| matches!(owner, JobOwner::Ingest(_)))
                .copied()
                .collect();
            owners
                .into_iter()
                .filter_map(|owner| table.remove(&owner))
                .flatten()
                .collect()
        };
        let aborted = abort_all(jobs);
        if aborted > 0 {
            debug!("DecodeJobs: Aborted {} in-flight ingestion tasks", aborted);
        }
        aborted
    }

    /// Number of unfinished tasks registered under `owner`
    pub fn active(&self, owner: JobOwner) -> usize {
        self.lock_table()
            .get(&owner)
            .map(|jobs| jobs.iter().filter(|job| !job.is_finished()).count())
            .unwrap_or(0)
    }

    /// Scope guard that releases `owner` when dropped
    pub fn scope(&self, owner: JobOwner) -> JobScope {
        JobScope {
            jobs: self.clone(),
            owner,
        }
    }
}

fn abort_all(jobs: Vec<AbortHandle>) -> usize {
    let mut running = 0;
    for job in jobs {
        if !job.is_finished() {
            running += 1;
            job.abort();
        }
    }
    running
}

/// Releases its owner's tasks on drop, so a cancelled or failed run never
/// leaves a decoder behind
pub struct JobScope {
    jobs: DecodeJobs,
    owner: JobOwner,
}

impl JobScope {
    pub fn owner(&self) -> JobOwner {
        self.owner
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.jobs.spawn(self.owner, fut)
    }

    /// Abort the owner's tasks now rather than at drop
    pub fn release(&self) -> usize {
        self.jobs.release(self.owner)
    }
}

impl Drop for JobScope {
    fn drop(&mut self) {
        self.jobs.release(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_aborts_owner_tasks() {
        let jobs = DecodeJobs::new();
        let owner = JobOwner::new_ingest();
        let other = JobOwner::new_ingest();

        let handle = jobs.spawn(owner, tokio::time::sleep(Duration::from_secs(60)));
        let other_handle = jobs.spawn(other, tokio::time::sleep(Duration::from_secs(60)));
        assert_eq!(jobs.active(owner), 1);

        assert_eq!(jobs.release(owner), 1);
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(jobs.active(other), 1);

        jobs.release(other);
        assert!(other_handle.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_release_ingestions_spares_previews() {
        let jobs = DecodeJobs::new();
        let ingest = JobOwner::new_ingest();
        let preview = JobOwner::new_preview();

        let a = jobs.spawn(ingest, tokio::time::sleep(Duration::from_secs(60)));
        let _b = jobs.spawn(preview, tokio::time::sleep(Duration::from_secs(60)));

        assert_eq!(jobs.release_ingestions(), 1);
        assert!(a.await.unwrap_err().is_cancelled());
        assert_eq!(jobs.active(preview), 1);
        jobs.release(preview);
    }

    #[tokio::test]
    async fn test_scope_drop_releases() {
        let jobs = DecodeJobs::new();
        let handle = {
            let scope = jobs.scope(JobOwner::new_ingest());
            scope.spawn(tokio::time::sleep(Duration::from_secs(60)))
        };
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
