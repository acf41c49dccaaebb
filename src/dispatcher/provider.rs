//! Pluggable sources of work for a [`Job`](super::job::Job).

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use crate::task::{TaskItem, TaskResult};

use super::job::Job;

/// Work source owned by a job.
///
/// `task_count` is the number of tasks not yet completed, including ones
/// currently handed out. The job is complete when it reaches zero.
pub trait TaskProvider: Send {
    /// Opaque configuration forwarded to agents on initialization.
    fn config(&self) -> Value;

    fn task_count(&self) -> u64;

    fn try_get_task(&mut self) -> Option<TaskItem>;

    /// Record a terminal outcome. Returns true if more tasks may now be
    /// available.
    fn complete_task(&mut self, task: &TaskItem, result: &TaskResult) -> bool;

    /// Called once when the job takes ownership. Providers that grow after
    /// the job started keep the notifier and fire it on each addition.
    fn attach(&mut self, _notifier: TaskNotifier) {}
}

/// Handle a provider uses to announce dynamically added work.
#[derive(Clone)]
pub struct TaskNotifier {
    job: Weak<Job>,
}

impl TaskNotifier {
    pub(crate) fn new(job: &Arc<Job>) -> Self {
        Self {
            job: Arc::downgrade(job),
        }
    }

    /// Must not be called while the provider is borrowed by the job.
    pub fn tasks_added(&self) {
        if let Some(job) = self.job.upgrade() {
            job.tasks_added();
        }
    }
}

#[derive(Default)]
struct FeedState {
    queue: VecDeque<TaskItem>,
    outstanding: u64,
    next_id: u64,
    notifier: Option<TaskNotifier>,
}

/// In-memory FIFO provider.
pub struct QueueTaskProvider {
    config: Value,
    state: Arc<Mutex<FeedState>>,
}

/// Cloneable handle that appends work to a [`QueueTaskProvider`].
#[derive(Clone)]
pub struct TaskFeed {
    state: Arc<Mutex<FeedState>>,
}

fn lock(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl QueueTaskProvider {
    pub fn new(config: Value) -> (Self, TaskFeed) {
        let state = Arc::new(Mutex::new(FeedState::default()));
        let provider = Self {
            config,
            state: state.clone(),
        };
        (provider, TaskFeed { state })
    }

    pub fn with_tasks(config: Value, tasks: impl IntoIterator<Item = TaskItem>) -> Self {
        let (provider, feed) = Self::new(config);
        feed.extend(tasks);
        provider
    }

    /// One task per non-empty line: identifier `task_<n>`, data is the line
    /// as a JSON string.
    pub fn from_lines<R: BufRead>(config: Value, reader: R) -> std::io::Result<Self> {
        let (provider, feed) = Self::new(config);
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if !line.is_empty() {
                feed.push_data(Value::String(line.to_string()));
            }
        }
        Ok(provider)
    }
}

impl TaskProvider for QueueTaskProvider {
    fn config(&self) -> Value {
        self.config.clone()
    }

    fn task_count(&self) -> u64 {
        let state = lock(&self.state);
        state.queue.len() as u64 + state.outstanding
    }

    fn try_get_task(&mut self) -> Option<TaskItem> {
        let mut state = lock(&self.state);
        let task = state.queue.pop_front()?;
        state.outstanding += 1;
        Some(task)
    }

    fn complete_task(&mut self, _task: &TaskItem, _result: &TaskResult) -> bool {
        let mut state = lock(&self.state);
        state.outstanding = state.outstanding.saturating_sub(1);
        !state.queue.is_empty()
    }

    fn attach(&mut self, notifier: TaskNotifier) {
        lock(&self.state).notifier = Some(notifier);
    }
}

impl TaskFeed {
    pub fn push(&self, task: TaskItem) {
        self.extend(std::iter::once(task));
    }

    /// Append a task with a generated `task_<n>` identifier.
    pub fn push_data(&self, data: Value) -> String {
        let identifier = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            format!("task_{}", state.next_id)
        };
        self.push(TaskItem::new(identifier.clone(), data));
        identifier
    }

    pub fn extend(&self, tasks: impl IntoIterator<Item = TaskItem>) {
        let notifier = {
            let mut state = lock(&self.state);
            let before = state.queue.len();
            state.queue.extend(tasks);
            if state.queue.len() == before {
                return;
            }
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.tasks_added();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_includes_handed_out_tasks() {
        let mut provider = QueueTaskProvider::with_tasks(
            Value::Null,
            vec![
                TaskItem::new("a", json!("echo a")),
                TaskItem::new("b", json!("echo b")),
            ],
        );
        assert_eq!(provider.task_count(), 2);

        let a = provider.try_get_task().unwrap();
        assert_eq!(a.identifier, "a");
        assert_eq!(provider.task_count(), 2);

        assert!(provider.complete_task(&a, &TaskResult::success(Value::Null)));
        assert_eq!(provider.task_count(), 1);

        let b = provider.try_get_task().unwrap();
        assert!(provider.try_get_task().is_none());
        assert!(!provider.complete_task(&b, &TaskResult::failure("x")));
        assert_eq!(provider.task_count(), 0);
    }

    #[test]
    fn from_lines_skips_blank_lines() {
        let input = "echo one\n\n   \necho two\n";
        let mut provider = QueueTaskProvider::from_lines(json!({"env": {}}), input.as_bytes()).unwrap();
        assert_eq!(provider.task_count(), 2);
        assert_eq!(provider.config(), json!({"env": {}}));

        let first = provider.try_get_task().unwrap();
        assert_eq!(first.identifier, "task_1");
        assert_eq!(first.data, json!("echo one"));
        let second = provider.try_get_task().unwrap();
        assert_eq!(second.identifier, "task_2");
        assert_eq!(second.data, json!("echo two"));
    }

    #[test]
    fn feed_appends_to_provider() {
        let (mut provider, feed) = QueueTaskProvider::new(Value::Null);
        assert!(feed.is_empty());
        let id = feed.push_data(json!("true"));
        assert_eq!(feed.len(), 1);
        assert_eq!(provider.try_get_task().unwrap().identifier, id);
    }
}
