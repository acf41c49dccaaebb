//! Demand-driven task queue for one submitted unit of work.
//!
//! Agent proxies pull with [`Job::get_tasks`] and report back with
//! [`Job::complete_task`] or [`Job::cancel_tasks`]. Cancelled tasks are
//! re-issued before any new work. Every callback (availability waiters, the
//! dispatcher's event channel) fires after the internal lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::task::{TaskItem, TaskResult};

use super::provider::{TaskNotifier, TaskProvider};

/// Notifications from a job to its dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Task count changed or the job started
    Updated(String),
    Completed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Not yet handed out (includes requeued work)
    pub pending: u64,
    /// Handed out and not yet finished
    pub running: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

type Waiter = Box<dyn FnOnce() + Send>;

struct JobInner {
    provider: Box<dyn TaskProvider>,
    requeue: VecDeque<TaskItem>,
    /// One slot per subscriber; firing empties the slot
    waiters: HashMap<String, Waiter>,
    running: u64,
    completed: u64,
    succeeded: u64,
    failed: u64,
    started: bool,
    finished: bool,
}

impl JobInner {
    fn has_available(&self) -> bool {
        !self.requeue.is_empty()
    }

    fn take_waiters(&mut self) -> Vec<Waiter> {
        self.waiters.drain().map(|(_, waiter)| waiter).collect()
    }
}

pub struct Job {
    name: String,
    priority: i32,
    config: Value,
    inner: Mutex<JobInner>,
    events: mpsc::UnboundedSender<JobEvent>,
    done: watch::Sender<bool>,
}

impl Job {
    pub fn new(
        provider: Box<dyn TaskProvider>,
        priority: i32,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Arc<Self> {
        let config = provider.config();
        let (done, _) = watch::channel(false);
        let job = Arc::new(Self {
            name: format!("job_{}", Uuid::new_v4().simple()),
            priority,
            config,
            inner: Mutex::new(JobInner {
                provider,
                requeue: VecDeque::new(),
                waiters: HashMap::new(),
                running: 0,
                completed: 0,
                succeeded: 0,
                failed: 0,
                started: false,
                finished: false,
            }),
            events,
            done,
        });

        let notifier = TaskNotifier::new(&job);
        job.lock().provider.attach(notifier);
        job
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Tasks not yet completed, in flight included.
    pub fn task_count(&self) -> u64 {
        self.lock().provider.task_count()
    }

    pub fn stats(&self) -> JobStats {
        let inner = self.lock();
        let remaining = inner.provider.task_count();
        JobStats {
            pending: remaining.saturating_sub(inner.running),
            running: inner.running,
            completed: inner.completed,
            succeeded: inner.succeeded,
            failed: inner.failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the job has completed.
    pub async fn wait_completed(&self) {
        let mut done = self.done.subscribe();
        // the sender lives in self, so this only fails if the job is gone
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Announce the job. A job with no work completes immediately.
    pub fn start(&self) {
        let empty = {
            let mut inner = self.lock();
            if inner.started {
                return;
            }
            inner.started = true;
            let empty = inner.provider.task_count() == 0;
            if empty {
                inner.finished = true;
            }
            empty
        };

        if empty {
            tracing::info!(job = %self.name, "Job has no tasks");
            self.finish();
        } else {
            tracing::info!(job = %self.name, priority = self.priority, "Job started");
            let _ = self.events.send(JobEvent::Updated(self.name.clone()));
        }
    }

    /// Hand out up to `capacity` tasks, requeued ones first. When fewer are
    /// available, `on_available` replaces any earlier registration by
    /// `subscriber` and fires once when more work appears.
    pub fn get_tasks<F>(&self, capacity: usize, subscriber: &str, on_available: F) -> Vec<TaskItem>
    where
        F: FnOnce() + Send + 'static,
    {
        if capacity == 0 {
            return Vec::new();
        }

        let mut inner = self.lock();
        if inner.finished {
            return Vec::new();
        }

        let mut tasks = Vec::with_capacity(capacity);
        while tasks.len() < capacity {
            match inner.requeue.pop_front() {
                Some(task) => tasks.push(task),
                None => break,
            }
        }
        while tasks.len() < capacity {
            match inner.provider.try_get_task() {
                Some(task) => tasks.push(task),
                None => break,
            }
        }

        inner.running += tasks.len() as u64;
        if tasks.len() < capacity {
            inner
                .waiters
                .insert(subscriber.to_string(), Box::new(on_available));
        }

        if !tasks.is_empty() {
            tracing::debug!(job = %self.name, subscriber, tasks = tasks.len(), "Tasks handed out");
        }
        tasks
    }

    /// Drop a subscriber's pending availability callback.
    pub fn unsubscribe(&self, subscriber: &str) {
        self.lock().waiters.remove(subscriber);
    }

    pub fn complete_task(&self, task: &TaskItem, result: &TaskResult) {
        let (waiters, finished) = {
            let mut inner = self.lock();
            let more = inner.provider.complete_task(task, result);
            inner.running = inner.running.saturating_sub(1);
            inner.completed += 1;
            if result.success {
                inner.succeeded += 1;
            } else {
                inner.failed += 1;
            }

            let waiters = if more || inner.has_available() {
                inner.take_waiters()
            } else {
                Vec::new()
            };

            let finished = !inner.finished && inner.provider.task_count() == 0;
            if finished {
                inner.finished = true;
            }
            (waiters, finished)
        };

        tracing::debug!(
            job = %self.name,
            task = %task.identifier,
            success = result.success,
            "Task completed"
        );

        for waiter in waiters {
            waiter();
        }
        let _ = self.events.send(JobEvent::Updated(self.name.clone()));
        if finished {
            self.finish();
        }
    }

    /// Return interrupted tasks to the front of the requeue, in order.
    pub fn cancel_tasks(&self, tasks: Vec<TaskItem>) {
        if tasks.is_empty() {
            return;
        }
        let count = tasks.len();
        let waiters = {
            let mut inner = self.lock();
            for task in tasks.into_iter().rev() {
                inner.requeue.push_front(task);
            }
            inner.running = inner.running.saturating_sub(count as u64);
            inner.take_waiters()
        };

        tracing::debug!(job = %self.name, tasks = count, "Tasks requeued");
        for waiter in waiters {
            waiter();
        }
    }

    /// Provider reported new work.
    pub fn tasks_added(&self) {
        let waiters = {
            let mut inner = self.lock();
            if inner.finished {
                return;
            }
            inner.take_waiters()
        };

        for waiter in waiters {
            waiter();
        }
        let _ = self.events.send(JobEvent::Updated(self.name.clone()));
    }

    fn finish(&self) {
        tracing::info!(job = %self.name, "Job completed");
        self.done.send_replace(true);
        let _ = self.events.send(JobEvent::Completed(self.name.clone()));
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}
