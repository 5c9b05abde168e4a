// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The task manager: an ordered set of timed tasks drained by a single loop
//! with one second resolution. A task that returns a new time from its run
//! is rescheduled, otherwise it is dropped.

use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{sync::Notify, task::JoinHandle};

/// A scheduled unit of work.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// A short name for log lines.
    fn name(&self) -> &str {
        "task"
    }

    /// Run the task. Returning a time reschedules the task at that time;
    /// returning `None` retires it.
    async fn run(&self, now: Instant) -> Option<Instant>;
}

#[derive(Default)]
struct TaskSet {
    entries: BTreeMap<(Instant, u64), Arc<dyn Task>>,
    to_unregister: Vec<Arc<dyn Task>>,
    seq: u64,
}

struct TaskInner {
    tasks: Mutex<TaskSet>,
    notify: Notify,
    shutdown: std::sync::atomic::AtomicBool,
    resolution: Duration,
}

/// Runs registered tasks at their scheduled times.
pub struct TaskManager {
    inner: Arc<TaskInner>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    /// Create a stopped task manager with one second resolution.
    pub fn new() -> Self {
        Self::with_resolution(Duration::from_secs(1))
    }

    /// Create a stopped task manager with the given tick resolution.
    pub fn with_resolution(resolution: Duration) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                tasks: Mutex::new(TaskSet::default()),
                notify: Notify::new(),
                shutdown: std::sync::atomic::AtomicBool::new(false),
                resolution,
            }),
            runner: Mutex::new(None),
        }
    }

    /// Spawn the runner loop.
    pub fn start(&self) -> bool {
        let mut runner = self.runner.lock().expect("task manager poisoned");
        if runner.is_some() {
            log::error!("The task manager is already running");
            return false;
        }
        log::debug!("Starting the task manager...");
        self.inner.shutdown.store(false, std::sync::atomic::Ordering::SeqCst);
        let inner = self.inner.clone();
        runner.replace(tokio::spawn(async move {
            run_tasks(inner).await;
        }));
        true
    }

    /// Request shutdown and join the runner. Pending tasks are dropped.
    pub async fn stop(&self) -> bool {
        let runner = self.runner.lock().expect("task manager poisoned").take();
        match runner {
            Some(handle) => {
                log::debug!("Stopping the task manager...");
                self.inner.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                self.inner.notify.notify_one();
                let _ = handle.await;
                self.inner.tasks.lock().expect("task manager poisoned").entries.clear();
                true
            }
            None => {
                log::error!("The task manager is not running");
                false
            }
        }
    }

    /// Run the given task at the given time.
    pub fn register_task(&self, task: Arc<dyn Task>, when: Instant) {
        log::debug!("Registering task: {} to be run in {:?}", task.name(), when.saturating_duration_since(Instant::now()));
        let mut set = self.inner.tasks.lock().expect("task manager poisoned");
        let seq = set.seq;
        set.seq += 1;
        set.entries.insert((when, seq), task);
        drop(set);
        self.inner.notify.notify_one();
    }

    /// Remove a task if it has not run yet. The removal is deferred to the
    /// runner loop.
    pub fn unregister_task(&self, task: &Arc<dyn Task>) {
        log::debug!("Requesting unregistration of: {}", task.name());
        let mut set = self.inner.tasks.lock().expect("task manager poisoned");
        set.to_unregister.push(task.clone());
        drop(set);
        self.inner.notify.notify_one();
    }
}

async fn run_tasks(inner: Arc<TaskInner>) {
    loop {
        if inner.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        let now = Instant::now();
        let due: Vec<Arc<dyn Task>> = {
            let mut set = inner.tasks.lock().expect("task manager poisoned");
            let doomed: Vec<Arc<dyn Task>> = set.to_unregister.drain(..).collect();
            for task in doomed {
                let keys: Vec<(Instant, u64)> = set
                    .entries
                    .iter()
                    .filter(|(_, t)| Arc::ptr_eq(t, &task))
                    .map(|(k, _)| *k)
                    .collect();
                for key in keys {
                    log::debug!("Removing task: {}", task.name());
                    set.entries.remove(&key);
                }
            }
            let pending: Vec<(Instant, u64)> = set
                .entries
                .range(..=(now, u64::MAX))
                .map(|(k, _)| *k)
                .collect();
            pending
                .into_iter()
                .filter_map(|k| set.entries.remove(&k))
                .collect()
        };
        for task in due {
            log::trace!("Running task: {}", task.name());
            if let Some(next) = task.run(now).await {
                log::trace!("Will rerun task {} in {:?}", task.name(), next.saturating_duration_since(now));
                let mut set = inner.tasks.lock().expect("task manager poisoned");
                let seq = set.seq;
                set.seq += 1;
                set.entries.insert((next.max(now), seq), task);
            } else {
                log::debug!("Done with task: {}", task.name());
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(inner.resolution) => {}
            _ = inner.notify.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TickTask {
        runs: Arc<AtomicUsize>,
        reschedules: usize,
    }

    #[async_trait]
    impl Task for TickTask {
        fn name(&self) -> &str {
            "tick"
        }

        async fn run(&self, now: Instant) -> Option<Instant> {
            let done = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if done < self.reschedules {
                Some(now + Duration::from_millis(5))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn runs_and_reschedules() {
        let mgr = TaskManager::with_resolution(Duration::from_millis(5));
        assert!(mgr.start());
        let runs = Arc::new(AtomicUsize::new(0));
        mgr.register_task(
            Arc::new(TickTask {
                runs: runs.clone(),
                reschedules: 3,
            }),
            Instant::now(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(mgr.stop().await);
    }

    #[tokio::test]
    async fn unregister_prevents_run() {
        let mgr = TaskManager::with_resolution(Duration::from_millis(5));
        assert!(mgr.start());
        let runs = Arc::new(AtomicUsize::new(0));
        let task: Arc<dyn Task> = Arc::new(TickTask {
            runs: runs.clone(),
            reschedules: 1,
        });
        mgr.register_task(task.clone(), Instant::now() + Duration::from_millis(100));
        mgr.unregister_task(&task);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(mgr.stop().await);
    }

    #[tokio::test]
    async fn stop_interrupts_the_wait() {
        let mgr = TaskManager::with_resolution(Duration::from_secs(30));
        assert!(mgr.start());
        let started = Instant::now();
        assert!(mgr.stop().await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
