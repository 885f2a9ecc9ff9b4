//! Periodic execution of the idle-object evictor
//!
//! The pool never owns a timer itself. It asks a [`Scheduler`] to run its
//! eviction tick every interval and keeps only the returned
//! [`ScheduleHandle`], which it cancels on close or when the interval changes.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};

/// Task run on every tick
pub type Task = Arc<dyn Fn() + Send + Sync>;

/// Cancels a scheduled task
pub trait ScheduleHandle: Send + Sync {
    /// Stop future ticks. A tick already running finishes normally.
    fn cancel(&self);
}

/// Something that can run a task at a fixed interval
pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval`, first after one full interval
    fn schedule(&self, interval: Duration, task: Task) -> Box<dyn ScheduleHandle>;
}

/// Runs each schedule on its own named background thread
#[derive(Debug, Clone, Default)]
pub struct ThreadScheduler {
    name: Option<String>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used for the spawned threads
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

struct ThreadHandle {
    stop: Sender<()>,
}

impl ScheduleHandle for ThreadHandle {
    fn cancel(&self) {
        let _ = self.stop.try_send(());
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, interval: Duration, task: Task) -> Box<dyn ScheduleHandle> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let ticks = channel::tick(interval);
        let name = self.name.clone().unwrap_or_else(|| "objectpool-evictor".to_string());

        let spawned = thread::Builder::new().name(name).spawn(move || {
            loop {
                crossbeam::select! {
                    recv(ticks) -> _ => task(),
                    // a dropped handle stops the schedule too
                    recv(stopped) -> _ => break,
                }
            }
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn evictor thread, eviction disabled");
        }

        Box::new(ThreadHandle { stop })
    }
}

/// Runs each schedule as a task on a tokio runtime; ticks execute on the
/// blocking thread pool since factory callbacks may block.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    /// Use the runtime the caller is running on
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

struct TokioHandle {
    task: tokio::task::JoinHandle<()>,
}

impl ScheduleHandle for TokioHandle {
    fn cancel(&self) {
        self.task.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, task: Task) -> Box<dyn ScheduleHandle> {
        let task = self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = tokio::time::interval_at(start, interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let task = Arc::clone(&task);
                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                    tracing::error!(error = %e, "evictor tick did not complete");
                }
            }
        });
        Box::new(TokioHandle { task })
    }
}
