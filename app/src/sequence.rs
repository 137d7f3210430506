use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::*;

/// Runs submitted work one item at a time, in submission order.
pub struct Sequence {
    name: &'static str,
    slot: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
}

impl Sequence {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: tokio::sync::Mutex::new(()),
            queued: AtomicUsize::new(0),
        }
    }

    /// Waits for every earlier submission to finish, then runs `work` to completion.
    pub async fn add_and_promise<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let queued = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(sequence = self.name, queued, "Queued work");
        let _slot = self.slot.lock().await;
        let output = work().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        output
    }

    /// Submissions waiting or running.
    pub fn count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobsError {
    #[error("Synchronous job {0} already registered")]
    AlreadyRegistered(String),
}

/// Named periodic jobs. Each run starts `period` after the previous one finished.
#[derive(Default)]
pub struct JobsQueue {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl JobsQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: &str, period: Duration, job: F) -> Result<(), JobsError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(name) {
            return Err(JobsError::AlreadyRegistered(name.to_string()));
        }
        let label = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                trace!(job = %label, "Running job");
                job().await;
            }
        });
        jobs.insert(name.to_string(), handle);
        debug!(job = name, ?period, "Registered job");
        Ok(())
    }

    /// Cancels `name`; unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        let removed = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(handle) = removed {
            handle.abort();
            debug!(job = name, "Unregistered job");
        }
    }

    pub fn unregister_all(&self) {
        let jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (name, handle) in jobs {
            handle.abort();
            debug!(job = %name, "Unregistered job");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

impl Drop for JobsQueue {
    fn drop(&mut self) {
        self.unregister_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn sequence_runs_in_submission_order() {
        let sequence = Arc::new(Sequence::new("test"));
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let sequence = sequence.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                sequence
                    .add_and_promise(|| async {
                        log.lock().await.push(format!("start {i}"));
                        tokio::time::sleep(Duration::from_millis(5 - i)).await;
                        log.lock().await.push(format!("end {i}"));
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = log.lock().await;
        for pair in log.chunks(2) {
            let (start, end) = (&pair[0], &pair[1]);
            assert_eq!(start.replace("start", "end"), *end);
        }
        assert_eq!(sequence.count(), 0);
    }

    #[tokio::test]
    async fn sequence_returns_work_output() {
        let sequence = Sequence::new("test");
        assert_eq!(sequence.add_and_promise(|| async { 7 }).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_repeat_until_unregistered() {
        let jobs = JobsQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        jobs.register("tick", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        assert_eq!(
            jobs.register("tick", Duration::from_secs(1), || async {}),
            Err(JobsError::AlreadyRegistered("tick".into()))
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        jobs.unregister("tick");
        jobs.unregister("tick");
        assert!(!jobs.is_registered("tick"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_all_clears_every_job() {
        let jobs = JobsQueue::new();
        jobs.register("a", Duration::from_secs(1), || async {}).unwrap();
        jobs.register("b", Duration::from_secs(1), || async {}).unwrap();
        jobs.unregister_all();
        assert!(!jobs.is_registered("a") && !jobs.is_registered("b"));
        jobs.register("a", Duration::from_secs(1), || async {}).unwrap();
    }
}
