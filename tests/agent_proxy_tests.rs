
use std::sync::Arc;
use std::time::Duration;

use taskgrid::dispatcher::{AgentProxy, ProxyState};
use taskgrid::peer::ConnectionState;
use taskgrid::task::TaskState;
use test_harness::{
    assert_eventually, endpoint, job_with, proxy_context, AgentCall, FakeAgent, FakeConnector,
    InitBehavior, RecordingCoordinator, StartBehavior,
};

const TIMEOUT: Duration = Duration::from_secs(3);

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn wait_for_batches(agent: &Arc<FakeAgent>, count: usize) {
    let agent = agent.clone();
    assert_eventually(
        || {
            let agent = agent.clone();
            async move { agent.started_batches().len() >= count }
        },
        TIMEOUT,
        &format!("expected {} StartTasks batches", count),
    )
    .await;
}

async fn wait_for_state(proxy: &AgentProxy, state: ProxyState) {
    let ok = test_harness::wait_for(
        || async { proxy.status().await.is_some_and(|s| s.state == state) },
        TIMEOUT,
        Duration::from_millis(20),
    )
    .await;
    assert!(ok, "proxy never reached {:?}", state);
}

/// Three tasks, one agent of capacity 2: the first batch fills the agent and
/// each completion pulls the next task.
#[tokio::test]
async fn test_end_to_end_three_tasks_capacity_two() {
    let connector = FakeConnector::new(2);
    let coordinator = RecordingCoordinator::new();
    let (context, active) = proxy_context(connector.clone(), coordinator, 5);
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();

    active.send_replace(Some(job.clone()));
    agent.activate();

    wait_for_batches(&agent, 1).await;
    let calls = agent.calls();
    assert!(matches!(calls[0], AgentCall::Initialize(_)));
    assert_eq!(calls[1], AgentCall::StartTasks(ids(&["t1", "t2"])));

    agent.complete("t1", true);
    wait_for_batches(&agent, 2).await;
    assert_eq!(agent.started_batches()[1], ids(&["t3"]));

    agent.complete("t2", true);
    agent.complete("t3", true);

    let waited = tokio::time::timeout(TIMEOUT, job.wait_completed()).await;
    assert!(waited.is_ok(), "job should complete");
    let stats = job.stats();
    assert_eq!(stats.succeeded, 3);
    assert_eq!(stats.running, 0);
    assert_eq!(agent.init_count(), 1);

    proxy.dispose().await;
}

/// Work is only requested after the agent says it is active.
#[tokio::test]
async fn test_no_work_before_activation() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(agent.calls().is_empty());
    assert_eq!(proxy.status().await.unwrap().state, ProxyState::Uninitialized);

    agent.activate();
    wait_for_batches(&agent, 1).await;
    assert!(proxy.status().await.unwrap().activated);
}

/// With two J1 tasks running, switching to J2 waits until both finish.
#[tokio::test]
async fn test_drain_before_switch() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (first, _first_events) = job_with(&["a1", "a2", "a3"], 0);
    let (second, _second_events) = job_with(&["b1"], 5);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(first.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;
    wait_for_state(&proxy, ProxyState::Ready).await;

    active.send_replace(Some(second.clone()));
    wait_for_state(&proxy, ProxyState::Draining).await;

    agent.complete("a1", true);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(agent.init_count(), 1, "must not switch with a task in flight");
    assert_eq!(agent.started_batches().len(), 1, "no J1 refill while draining");

    agent.complete("a2", true);
    wait_for_batches(&agent, 2).await;
    assert_eq!(agent.init_count(), 2);
    assert_eq!(agent.started_batches()[1], ids(&["b1"]));

    let status = proxy.status().await.unwrap();
    assert_eq!(status.job.as_deref(), Some(second.name()));

    // J1 keeps its untouched task for a later run
    assert_eq!(first.stats().pending, 1);
    assert_eq!(first.stats().succeeded, 2);
}

/// Disposing a proxy returns its in-flight tasks to the front of the job.
#[tokio::test]
async fn test_dispose_requeues_in_flight_tasks() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;
    wait_for_state(&proxy, ProxyState::Ready).await;
    assert_eq!(job.stats().running, 2);

    proxy.dispose().await;
    assert!(agent.is_closed());
    assert_eq!(job.stats().running, 0);

    let again = job.get_tasks(3, "other", || {});
    let names: Vec<&str> = again.iter().map(|t| t.identifier.as_str()).collect();
    assert_eq!(names, vec!["t1", "t2", "t3"]);

    // disposing twice is harmless
    proxy.dispose().await;
}

/// A task the agent fails to start is reported as a failed completion and
/// the freed slot is refilled.
#[tokio::test]
async fn test_start_failure_completes_task_as_failed() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    let _proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    agent.script_start(StartBehavior::FailTasks(ids(&["t1"])));
    active.send_replace(Some(job.clone()));
    agent.activate();

    wait_for_batches(&agent, 2).await;
    assert_eq!(agent.started_batches()[0], ids(&["t1", "t2"]));
    assert_eq!(agent.started_batches()[1], ids(&["t3"]));

    let stats = job.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.running, 2);
}

/// A StartTasks call lost in transport is resent after the retry delay
/// without any other trigger.
#[tokio::test]
async fn test_start_transport_error_resends_batch() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    agent.script_start(StartBehavior::TransportError);
    active.send_replace(Some(job.clone()));
    agent.activate();

    wait_for_batches(&agent, 2).await;
    let batches = agent.started_batches();
    assert_eq!(batches[0], ids(&["t1", "t2"]));
    assert_eq!(batches[1], ids(&["t1", "t2"]));

    let started = test_harness::wait_for(
        || async { proxy.status().await.is_some_and(|s| s.active == 2) },
        TIMEOUT,
        Duration::from_millis(20),
    )
    .await;
    assert!(started, "resent tasks should be active");
    assert_eq!(job.stats().running, 2);
    let status = proxy.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(
        status.tasks,
        vec![
            ("t1".to_string(), TaskState::Active),
            ("t2".to_string(), TaskState::Active),
        ]
    );
    assert_eq!(agent.started_batches().len(), 2);
}

/// An agent that completes a task before its start result arrives is
/// accepted.
#[tokio::test]
async fn test_early_completion_is_accepted() {
    let connector = FakeConnector::new(1);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2"], 0);

    let _proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;

    agent.complete("t1", false);
    wait_for_batches(&agent, 2).await;
    assert_eq!(agent.started_batches()[1], ids(&["t2"]));
    assert_eq!(job.stats().failed, 1);
}

/// An agent that rejects the job configuration is released for that job.
#[tokio::test]
async fn test_rejected_initialization_releases_agent() {
    let connector = FakeConnector::new(2);
    let coordinator = RecordingCoordinator::new();
    let (context, active) = proxy_context(connector.clone(), coordinator.clone(), 5);
    let (job, _events) = job_with(&["t1"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    agent.script_init(InitBehavior::Reject("bad config".to_string()));
    active.send_replace(Some(job.clone()));
    agent.activate();

    wait_for_state(&proxy, ProxyState::Released).await;
    let coordinator_probe = coordinator.clone();
    assert_eventually(
        || {
            let coordinator = coordinator_probe.clone();
            async move { !coordinator.releases().is_empty() }
        },
        TIMEOUT,
        "release should reach the coordinator",
    )
    .await;
    assert_eq!(
        coordinator.releases(),
        vec![(job.name().to_string(), "agent_1".to_string())]
    );

    // a released proxy pulls nothing, even when poked
    agent.activate();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(agent.started_batches().is_empty());
    assert_eq!(job.stats().pending, 1);
}

/// A transport failure during initialization is retried.
#[tokio::test]
async fn test_initialization_transport_error_retries() {
    let connector = FakeConnector::new(1);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1"], 0);

    let _proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    agent.script_init(InitBehavior::TransportError);
    active.send_replace(Some(job.clone()));
    agent.activate();

    wait_for_batches(&agent, 1).await;
    assert_eq!(agent.init_count(), 2);
}

/// Deactivation requeues in-flight work; reactivation re-initializes.
#[tokio::test]
async fn test_deactivation_requeues_and_reinitializes() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;
    wait_for_state(&proxy, ProxyState::Ready).await;

    agent.deactivate();
    wait_for_state(&proxy, ProxyState::Uninitialized).await;
    assert_eq!(job.stats().running, 0);
    assert_eq!(job.stats().pending, 2);

    agent.activate();
    wait_for_batches(&agent, 2).await;
    assert_eq!(agent.init_count(), 2);
    assert_eq!(agent.started_batches()[1], ids(&["t1", "t2"]));
}

/// Connection loss requeues in-flight tasks.
#[tokio::test]
async fn test_connection_loss_requeues_tasks() {
    let connector = FakeConnector::new(2);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2", "t3"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;
    wait_for_state(&proxy, ProxyState::Ready).await;

    agent.set_state(ConnectionState::Disconnected);
    wait_for_state(&proxy, ProxyState::Uninitialized).await;

    let status = proxy.status().await.unwrap();
    assert!(!status.activated);
    assert_eq!(status.pending + status.active, 0);
    assert_eq!(job.stats().running, 0);
    assert_eq!(job.stats().pending, 3);
}

async fn step(agent: &FakeAgent, proxy: &AgentProxy, state: ConnectionState, attempts: u32) {
    agent.set_state(state);
    let ok = test_harness::wait_for(
        || async {
            proxy
                .status()
                .await
                .is_some_and(|s| s.reconnect_attempts == attempts)
        },
        TIMEOUT,
        Duration::from_millis(20),
    )
    .await;
    assert!(ok, "expected {} reconnect attempts after {}", attempts, state);
    // let the watch settle so the next state is seen separately
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Exceeding the reconnect budget releases the agent and closes the
/// connection.
#[tokio::test]
async fn test_reconnect_budget_exhaustion_releases_agent() {
    let connector = FakeConnector::new(1);
    let coordinator = RecordingCoordinator::new();
    let (context, active) = proxy_context(connector.clone(), coordinator.clone(), 2);
    let (job, _events) = job_with(&["t1"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));

    step(&agent, &proxy, ConnectionState::Connecting, 1).await;
    step(&agent, &proxy, ConnectionState::Disconnected, 1).await;
    step(&agent, &proxy, ConnectionState::Connecting, 2).await;
    step(&agent, &proxy, ConnectionState::Disconnected, 2).await;

    agent.set_state(ConnectionState::Connecting);
    wait_for_state(&proxy, ProxyState::Released).await;
    assert!(agent.is_closed());

    let coordinator_probe = coordinator.clone();
    assert_eventually(
        || {
            let coordinator = coordinator_probe.clone();
            async move { !coordinator.releases().is_empty() }
        },
        TIMEOUT,
        "release should reach the coordinator",
    )
    .await;
    assert_eq!(coordinator.releases()[0].1, "agent_1");
}

/// A successful reconnect resets the attempt count.
#[tokio::test]
async fn test_reconnect_count_resets_on_connect() {
    let connector = FakeConnector::new(1);
    let (context, _active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 2);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();

    for _ in 0..3 {
        step(&agent, &proxy, ConnectionState::Connecting, 1).await;
        step(&agent, &proxy, ConnectionState::Disconnected, 1).await;
        step(&agent, &proxy, ConnectionState::Connecting, 2).await;
        step(&agent, &proxy, ConnectionState::Connected, 0).await;
    }

    let status = proxy.status().await.unwrap();
    assert_ne!(status.state, ProxyState::Released);
    assert!(!agent.is_closed());
}

/// Completions for tasks the proxy never handed out are ignored.
#[tokio::test]
async fn test_unknown_completion_ignored() {
    let connector = FakeConnector::new(1);
    let (context, active) = proxy_context(connector.clone(), RecordingCoordinator::new(), 5);
    let (job, _events) = job_with(&["t1", "t2"], 0);

    let proxy = AgentProxy::spawn(endpoint("agent_1", "10.0.0.2"), context).unwrap();
    let agent = connector.agent("agent_1").unwrap();
    active.send_replace(Some(job.clone()));
    agent.activate();
    wait_for_batches(&agent, 1).await;
    wait_for_state(&proxy, ProxyState::Ready).await;

    agent.complete("ghost", true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(job.stats().completed, 0);
    assert_eq!(agent.started_batches().len(), 1);
}
