
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use taskgrid::dispatcher::{Job, JobEvent, QueueTaskProvider};
use taskgrid::task::{TaskItem, TaskResult};
use test_harness::{job_with, tasks};

fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = count.clone();
    (count, move || {
        hook.fetch_add(1, Ordering::SeqCst);
    })
}

fn names(tasks: &[TaskItem]) -> Vec<&str> {
    tasks.iter().map(|t| t.identifier.as_str()).collect()
}

fn drain(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[test]
fn test_get_tasks_respects_capacity() {
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    assert!(job.get_tasks(0, "a", || {}).is_empty());
    let first = job.get_tasks(2, "a", || {});
    assert_eq!(names(&first), vec!["t1", "t2"]);
    let rest = job.get_tasks(5, "b", || {});
    assert_eq!(names(&rest), vec!["t3"]);

    let stats = job.stats();
    assert_eq!(stats.running, 3);
    assert_eq!(stats.pending, 0);
}

/// Cancelled tasks come back before fresh provider tasks, in their original
/// order.
#[test]
fn test_cancelled_tasks_are_served_first() {
    let (job, _events) = job_with(&["t1", "t2", "t3", "t4"], 0);

    let handed = job.get_tasks(3, "a", || {});
    assert_eq!(names(&handed), vec!["t1", "t2", "t3"]);

    job.cancel_tasks(vec![handed[1].clone(), handed[2].clone()]);
    assert_eq!(job.stats().running, 1);
    assert_eq!(job.stats().pending, 3);

    let again = job.get_tasks(4, "b", || {});
    assert_eq!(names(&again), vec!["t2", "t3", "t4"]);
}

/// No task is lost: every handed-out task is either completed or handed out
/// again.
#[test]
fn test_every_task_completes_exactly_once() {
    let (job, _events) = job_with(&["t1", "t2", "t3", "t4", "t5"], 0);
    job.start();

    let mut completed = Vec::new();
    let first = job.get_tasks(3, "a", || {});
    job.complete_task(&first[0], &TaskResult::success(Value::Null));
    completed.push(first[0].identifier.clone());
    job.cancel_tasks(first[1..].to_vec());

    loop {
        let batch = job.get_tasks(2, "b", || {});
        if batch.is_empty() {
            break;
        }
        for task in batch {
            job.complete_task(&task, &TaskResult::success(Value::Null));
            completed.push(task.identifier);
        }
    }

    completed.sort();
    assert_eq!(completed, vec!["t1", "t2", "t3", "t4", "t5"]);
    assert!(job.is_completed());
    assert_eq!(job.stats().succeeded, 5);
}

/// The availability hook fires once; a later registration replaces an
/// earlier one from the same subscriber.
#[test]
fn test_availability_hook_is_single_shot_and_replaced() {
    let (job, _events) = job_with(&["t1", "t2"], 0);
    let handed = job.get_tasks(2, "agent_1", || {});
    assert_eq!(handed.len(), 2);

    let (stale, stale_hook) = counter();
    let (current, current_hook) = counter();
    assert!(job.get_tasks(1, "agent_1", stale_hook).is_empty());
    assert!(job.get_tasks(1, "agent_1", current_hook).is_empty());

    job.cancel_tasks(vec![handed[0].clone()]);
    assert_eq!(stale.load(Ordering::SeqCst), 0);
    assert_eq!(current.load(Ordering::SeqCst), 1);

    // slot is empty now
    job.cancel_tasks(vec![handed[1].clone()]);
    assert_eq!(current.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unsubscribe_drops_hook() {
    let (job, _events) = job_with(&["t1"], 0);
    let handed = job.get_tasks(1, "agent_1", || {});

    let (count, hook) = counter();
    assert!(job.get_tasks(1, "agent_1", hook).is_empty());
    job.unsubscribe("agent_1");
    job.cancel_tasks(handed);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_completion_counts_and_events() {
    let (job, mut events) = job_with(&["t1", "t2"], 3);
    job.start();
    assert_eq!(drain(&mut events), vec![JobEvent::Updated(job.name().to_string())]);

    let handed = job.get_tasks(2, "a", || {});
    job.complete_task(&handed[0], &TaskResult::failure("boom"));
    assert!(!job.is_completed());
    job.complete_task(&handed[1], &TaskResult::success(json!({"exit_code": 0})));
    assert!(job.is_completed());

    let stats = job.stats();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(job.task_count(), 0);

    let seen = drain(&mut events);
    assert_eq!(seen.last(), Some(&JobEvent::Completed(job.name().to_string())));
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, JobEvent::Completed(_)))
            .count(),
        1
    );

    // nothing more is handed out
    assert!(job.get_tasks(1, "a", || {}).is_empty());
}

#[tokio::test]
async fn test_empty_job_completes_on_start() {
    let (job, mut events) = job_with(&[], 0);
    assert!(job.name().starts_with("job_"));
    assert!(!job.is_completed());

    job.start();
    assert!(job.is_completed());
    job.wait_completed().await;
    assert_eq!(drain(&mut events), vec![JobEvent::Completed(job.name().to_string())]);
}

/// Tasks fed after the job started wake waiting agents.
#[test]
fn test_dynamic_feed_wakes_subscribers() {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (provider, feed) = QueueTaskProvider::new(Value::Null);
    feed.extend(tasks(&["t1"]));
    let job = Job::new(Box::new(provider), 0, events_tx);
    job.start();
    let _ = drain(&mut events);

    let first = job.get_tasks(2, "agent_1", || {});
    assert_eq!(names(&first), vec!["t1"]);

    let (count, hook) = counter();
    assert!(job.get_tasks(1, "agent_1", hook).is_empty());

    let id = feed.push_data(json!("echo later"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(drain(&mut events), vec![JobEvent::Updated(job.name().to_string())]);
    assert_eq!(job.task_count(), 2);

    let later = job.get_tasks(1, "agent_1", || {});
    assert_eq!(later[0].identifier, id);
}

#[test]
fn test_provider_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "echo one").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "  echo two  ").unwrap();
    writeln!(file, "exit 3").unwrap();
    file.flush().unwrap();

    let reader = std::io::BufReader::new(std::fs::File::open(file.path()).unwrap());
    let provider = QueueTaskProvider::from_lines(json!({"workdir": "/tmp"}), reader).unwrap();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let job = Job::new(Box::new(provider), 0, events_tx);

    assert_eq!(job.task_count(), 3);
    assert_eq!(job.config(), &json!({"workdir": "/tmp"}));
    let handed = job.get_tasks(3, "a", || {});
    assert_eq!(names(&handed), vec!["task_1", "task_2", "task_3"]);
    assert_eq!(handed[1].data, json!("echo two"));
}
