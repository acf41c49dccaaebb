
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use taskgrid::config::CoordinatorConfig;
use taskgrid::coordinator::Coordinator;
use taskgrid::registry::DispatcherPush;
use test_harness::{dispatcher_endpoint, endpoint};

fn start_coordinator() -> (Arc<Coordinator>, CancellationToken) {
    let token = CancellationToken::new();
    let (coordinator, outbox) = Coordinator::new(&CoordinatorConfig::default());
    tokio::spawn(coordinator.clone().run_outbox(outbox, token.clone()));
    (coordinator, token)
}

async fn next_push(receiver: &mut mpsc::UnboundedReceiver<DispatcherPush>) -> DispatcherPush {
    timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for push")
        .expect("push stream closed")
}

async fn assert_quiet(receiver: &mut mpsc::UnboundedReceiver<DispatcherPush>) {
    let pending = timeout(Duration::from_millis(100), receiver.recv()).await;
    assert!(pending.is_err(), "unexpected push: {:?}", pending);
}

#[tokio::test]
async fn test_dispatcher_receives_roster_on_connect() {
    let (coordinator, token) = start_coordinator();

    let mut conn = coordinator.connect_dispatcher(dispatcher_endpoint("d1", "10.1.0.1"));
    assert!(conn.first);
    assert_eq!(
        next_push(&mut conn.receiver).await,
        DispatcherPush::EndpointListUpdated(vec![])
    );
    assert_eq!(coordinator.connected_dispatchers().len(), 1);

    token.cancel();
}

#[tokio::test]
async fn test_agents_flow_to_announced_job() {
    let (coordinator, token) = start_coordinator();
    let mut dispatcher = coordinator.connect_dispatcher(dispatcher_endpoint("d1", "10.1.0.1"));
    let _ = next_push(&mut dispatcher.receiver).await;

    let agent_info = endpoint("agent_1", "10.0.0.1");
    let mut agent = coordinator.connect_agent(agent_info.clone());
    // the agent is greeted with the coordinator's identity
    let greeting = timeout(Duration::from_secs(2), agent.receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, coordinator.info());
    assert_quiet(&mut dispatcher.receiver).await;

    coordinator.update_job("d1", "job_1", 0, 10).unwrap();
    assert_eq!(
        next_push(&mut dispatcher.receiver).await,
        DispatcherPush::EndpointAdded(agent_info.clone())
    );
    assert_eq!(coordinator.snapshot().agents, vec![("agent_1".to_string(), Some("job_1".to_string()))]);

    // a second connection of the same dispatcher sees the current roster
    let mut redial = coordinator.connect_dispatcher(dispatcher_endpoint("d1", "10.1.0.1"));
    assert!(!redial.first);
    assert_eq!(
        next_push(&mut redial.receiver).await,
        DispatcherPush::EndpointListUpdated(vec![agent_info.clone()])
    );

    // losing the agent's only connection unassigns it
    coordinator.disconnect_agent("agent_1", agent.id);
    let removed = DispatcherPush::EndpointRemoved("agent_1".to_string());
    assert_eq!(next_push(&mut dispatcher.receiver).await, removed);
    assert_eq!(next_push(&mut redial.receiver).await, removed);
    assert!(coordinator.connected_agents().is_empty());

    token.cancel();
}

#[tokio::test]
async fn test_update_job_from_unregistered_dispatcher_fails() {
    let (coordinator, token) = start_coordinator();
    let err = coordinator.update_job("ghost", "job_1", 0, 1).unwrap_err();
    let status: tonic::Status = err.into();
    assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    token.cancel();
}

#[tokio::test]
async fn test_clear_and_release_reassign_agents() {
    let (coordinator, token) = start_coordinator();
    let mut d1 = coordinator.connect_dispatcher(dispatcher_endpoint("d1", "10.1.0.1"));
    let mut d2 = coordinator.connect_dispatcher(dispatcher_endpoint("d2", "10.1.0.2"));
    let _ = next_push(&mut d1.receiver).await;
    let _ = next_push(&mut d2.receiver).await;

    let agent_info = endpoint("agent_1", "10.0.0.1");
    let _agent = coordinator.connect_agent(agent_info.clone());

    coordinator.update_job("d1", "job_1", 5, 10).unwrap();
    coordinator.update_job("d2", "job_2", 0, 10).unwrap();
    assert_eq!(
        next_push(&mut d1.receiver).await,
        DispatcherPush::EndpointAdded(agent_info.clone())
    );

    // released agents move on and are not offered back
    coordinator.release_agent("d1", "job_1", "agent_1");
    assert_eq!(
        next_push(&mut d1.receiver).await,
        DispatcherPush::EndpointRemoved("agent_1".to_string())
    );
    assert_eq!(
        next_push(&mut d2.receiver).await,
        DispatcherPush::EndpointAdded(agent_info.clone())
    );

    coordinator.clear_job("d2");
    assert_eq!(
        next_push(&mut d2.receiver).await,
        DispatcherPush::EndpointRemoved("agent_1".to_string())
    );
    assert_quiet(&mut d1.receiver).await;
    assert_eq!(coordinator.snapshot().unassigned, vec!["agent_1".to_string()]);

    token.cancel();
}

#[tokio::test]
async fn test_dispatcher_disconnect_frees_agents() {
    let (coordinator, token) = start_coordinator();
    let d1_info = dispatcher_endpoint("d1", "10.1.0.1");
    let first = coordinator.connect_dispatcher(d1_info.clone());
    let second = coordinator.connect_dispatcher(d1_info);
    let _agent = coordinator.connect_agent(endpoint("agent_1", "10.0.0.1"));
    coordinator.update_job("d1", "job_1", 0, 10).unwrap();

    // the dispatcher lives while any connection remains
    coordinator.disconnect_dispatcher("d1", first.id);
    assert_eq!(
        coordinator.snapshot().agents,
        vec![("agent_1".to_string(), Some("job_1".to_string()))]
    );

    coordinator.disconnect_dispatcher("d1", second.id);
    let snapshot = coordinator.snapshot();
    assert!(snapshot.dispatchers.is_empty());
    assert!(snapshot.jobs.is_empty());
    assert_eq!(snapshot.unassigned, vec!["agent_1".to_string()]);

    // the freed agent goes to the next job that asks
    let mut d2 = coordinator.connect_dispatcher(dispatcher_endpoint("d2", "10.1.0.2"));
    let _ = next_push(&mut d2.receiver).await;
    coordinator.update_job("d2", "job_2", 0, 3).unwrap();
    assert!(matches!(
        next_push(&mut d2.receiver).await,
        DispatcherPush::EndpointAdded(info) if info.name == "agent_1"
    ));

    token.cancel();
}
