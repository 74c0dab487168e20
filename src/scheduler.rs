//! Runs named tasks at fixed intervals, each on its own thread.
//!
//! A task runs immediately when scheduled and then once per interval until it is stopped. Each
//! invocation is isolated: an error is logged, a panic is caught and logged, and in both cases
//! the task keeps its schedule. Tasks share nothing through the scheduler, so a slow or failing
//! task never delays another one.
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Counters of a scheduled task.
#[derive(Debug, Default)]
struct TaskCounters {
    ticks: AtomicU64,
    failures: AtomicU64,
    panics: AtomicU64,
}

/// Snapshot of a task's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Completed invocations, including failed ones.
    pub ticks: u64,
    /// Invocations that returned an error.
    pub failures: u64,
    /// Invocations that panicked.
    pub panics: u64,
}

impl TaskCounters {
    fn snapshot(&self) -> TaskStats {
        TaskStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

struct TaskHandle {
    join_handle: JoinHandle<()>,
    /// Used to send a stop command to the task thread.
    stop_sender: SyncSender<()>,
    counters: Arc<TaskCounters>,
}

impl TaskHandle {
    fn stop(&self) {
        // Error means that the thread has exited or that a stop command is already pending.
        // Either way the thread will not run another tick.
        let _ = self.stop_sender.try_send(());
    }
}

#[derive(Default)]
struct Tasks {
    running: HashMap<String, TaskHandle>,
    /// Stopped tasks whose last tick may still be in flight. Joined on shutdown.
    stopping: Vec<JoinHandle<()>>,
}

impl Tasks {
    /// Drop handles of stopped tasks whose thread has already exited.
    fn reap(&mut self) {
        self.stopping.retain(|handle| !handle.is_finished());
    }
}

/// Fixed-interval task runner with per-task start/stop.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<Tasks>,
    jitter: Duration,
}

impl Scheduler {
    /// Create a scheduler that runs tasks at their exact interval.
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    /// Create a scheduler that subtracts a random duration of up to `jitter` from every
    /// interval. This avoids several agents hitting the server in lockstep.
    pub fn with_jitter(jitter: Duration) -> Scheduler {
        Scheduler {
            tasks: Mutex::default(),
            jitter,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        // The lock is never held across user code, so it cannot be poisoned by a task panic.
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start running `task` now and then every `interval`, on a dedicated thread named after
    /// `name`.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateTask`] if a task with the same name is running.
    /// - [`Error::Io`] if the thread could not be spawned.
    pub fn schedule<F>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        mut task: F,
    ) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks();
        tasks.reap();
        if let Some(existing) = tasks.running.get(&name) {
            if !existing.join_handle.is_finished() {
                return Err(Error::DuplicateTask(name));
            }
        }

        // Buffer size of 1 is enough: stop commands beyond the first one are redundant.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let counters = Arc::new(TaskCounters::default());
        let jitter_bound = self.jitter;

        let join_handle = {
            let counters = Arc::clone(&counters);
            let name = name.clone();
            std::thread::Builder::new()
                .name(format!("split-sync-{name}"))
                .spawn(move || loop {
                    log::trace!(target: "split_sync", task = name.as_str(); "running task");
                    match catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            counters.failures.fetch_add(1, Ordering::Relaxed);
                            if err.is_transient() {
                                log::warn!(target: "split_sync", task = name.as_str(); "task failed, retrying next tick: {err}");
                            } else {
                                log::error!(target: "split_sync", task = name.as_str(); "task failed, check the configuration: {err}");
                            }
                        }
                        Err(panic) => {
                            counters.panics.fetch_add(1, Ordering::Relaxed);
                            log::error!(target: "split_sync", task = name.as_str(); "task panicked, retrying next tick: {}", panic_message(&*panic));
                        }
                    }
                    counters.ticks.fetch_add(1, Ordering::Relaxed);

                    match stop_receiver.recv_timeout(jitter(interval, jitter_bound)) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Loop back to run the next tick.
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "split_sync", task = name.as_str(); "task stopped");
                            return;
                        }
                    }
                })?
        };

        log::info!(target: "split_sync", task = name.as_str(), interval_ms = interval.as_millis() as u64; "scheduled task");
        if let Some(previous) = tasks.running.insert(
            name,
            TaskHandle {
                join_handle,
                stop_sender,
                counters,
            },
        ) {
            tasks.stopping.push(previous.join_handle);
        }
        Ok(())
    }

    /// Stop future ticks of task `name`. An in-flight tick is allowed to complete; this function
    /// does not wait for it. Returns `false` if no such task was scheduled.
    pub fn stop(&self, name: &str) -> bool {
        let mut tasks = self.tasks();
        tasks.reap();
        match tasks.running.remove(name) {
            Some(handle) => {
                handle.stop();
                tasks.stopping.push(handle.join_handle);
                true
            }
            None => false,
        }
    }

    /// Whether task `name` is scheduled and has not been stopped.
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.tasks().running.contains_key(name)
    }

    /// Names of scheduled tasks, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks().running.keys().cloned().collect();
        names.sort();
        names
    }

    /// Counters of task `name`, if it is scheduled.
    pub fn stats(&self, name: &str) -> Option<TaskStats> {
        self.tasks()
            .running
            .get(name)
            .map(|handle| handle.counters.snapshot())
    }

    /// Stop every task without waiting.
    pub fn stop_all(&self) {
        let mut tasks = self.tasks();
        tasks.reap();
        let running = std::mem::take(&mut tasks.running);
        for (_, handle) in running {
            handle.stop();
            tasks.stopping.push(handle.join_handle);
        }
    }

    /// Stop every task and block waiting for their threads to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskPanicked`] if a task thread panicked outside of a tick.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_all();
        let stopping = std::mem::take(&mut self.tasks().stopping);

        let mut result = Ok(());
        for handle in stopping {
            if handle.join().is_err() {
                result = Err(Error::TaskPanicked);
            }
        }
        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
