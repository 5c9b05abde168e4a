// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The job manager: a small worker pool that runs handler callbacks off the
//! socket pumps. Jobs are one-shot functors pushed onto a shared queue and
//! picked up by whichever worker is free.

use crate::status::{ErrorCode, Status, XrdResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::{sync::mpsc, task::JoinHandle};

/// A unit of work executed on a job manager worker.
#[async_trait]
pub trait Job: Send + 'static {
    /// Run the job. The job is consumed.
    async fn run(self: Box<Self>);
}

/// Worker pool with a blocking work queue.
pub struct JobManager {
    sender: Mutex<Option<mpsc::UnboundedSender<Box<dyn Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    /// Create a stopped job manager.
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers draining the queue. Starting an already running
    /// manager is an error.
    pub fn start(&self, count: usize) -> bool {
        let mut sender = self.sender.lock().expect("job manager poisoned");
        if sender.is_some() {
            log::error!("The job manager is already running");
            return false;
        }
        let (tx, rx) = mpsc::unbounded_channel::<Box<dyn Job>>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.workers.lock().expect("job manager poisoned");
        for id in 0..count.max(1) {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                log::debug!("Job worker {} up", id);
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => job.run().await,
                        None => break,
                    }
                }
                log::debug!("Job worker {} done", id);
            }));
        }
        sender.replace(tx);
        true
    }

    /// Whether the pool is accepting work.
    pub fn is_running(&self) -> bool {
        self.sender.lock().expect("job manager poisoned").is_some()
    }

    /// Queue a job for execution on any worker.
    pub fn queue(&self, job: Box<dyn Job>) -> XrdResult<()> {
        let sender = self.sender.lock().expect("job manager poisoned");
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| Status::error(ErrorCode::InvalidOp)),
            None => Err(Status::error(ErrorCode::Uninitialized)),
        }
    }

    /// Close the queue and join the workers. Queued jobs are drained first.
    pub async fn stop(&self) {
        let sender = self.sender.lock().expect("job manager poisoned").take();
        drop(sender);
        let workers: Vec<JoinHandle<()>> =
            self.workers.lock().expect("job manager poisoned").drain(..).collect();
        join_all(workers).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountJob {
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountJob {
        async fn run(self: Box<Self>) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn runs_queued_jobs_and_drains_on_stop() {
        let mgr = JobManager::new();
        assert!(mgr.start(2));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            mgr.queue(Box::new(CountJob {
                counter: counter.clone(),
            }))
            .unwrap();
        }
        mgr.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(!mgr.is_running());
    }

    #[tokio::test]
    async fn queue_fails_when_stopped() {
        let mgr = JobManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let err = mgr
            .queue(Box::new(CountJob { counter }))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Uninitialized);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mgr = JobManager::new();
        assert!(mgr.start(1));
        assert!(!mgr.start(1));
        mgr.stop().await;
    }
}
