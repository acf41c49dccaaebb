//! Outbound connections that keep one server stream open and redial when it
//! drops. Each publishes its [`ConnectionState`] on a watch channel; unary
//! calls share the same lazily connected channel.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;

use crate::config::ConnectionConfig;
use crate::error::{Result, TaskGridError};
use crate::peer::{AgentChannel, AgentConnector, AgentLink, ConnectionState, CoordinatorLink};
use crate::proto;
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::coordinator_service_client::CoordinatorServiceClient;
use crate::registry::{AgentPush, DispatcherPush};
use crate::task::{EndpointInfo, InitializationResult, TaskItem, TaskResult};

use super::convert;

/// Lazily connected channel to `url`.
pub fn lazy_channel(url: &str, config: &ConnectionConfig) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(url.to_string())
        .map_err(|e| TaskGridError::InvalidPayload(format!("invalid url {}: {}", url, e)))?
        .connect_timeout(config.connect_timeout());
    Ok(endpoint.connect_lazy())
}

/// Redial delay with up to 25% random jitter.
fn jittered(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Open a server stream with `open`, feed every message to `on_message`,
/// and redial after `config.redial_delay` whenever the stream ends, until
/// `token` is cancelled.
async fn hold_stream<T, F, Fut, H>(
    peer: String,
    config: ConnectionConfig,
    token: CancellationToken,
    state: watch::Sender<ConnectionState>,
    mut open: F,
    mut on_message: H,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<tonic::Response<Streaming<T>>, tonic::Status>>,
    H: FnMut(T),
{
    loop {
        state.send_replace(ConnectionState::Connecting);
        tracing::trace!(peer = %peer, "Dialing");

        let opened = tokio::select! {
            _ = token.cancelled() => break,
            opened = open() => opened,
        };

        match opened {
            Ok(response) => {
                state.send_replace(ConnectionState::Connected);
                tracing::debug!(peer = %peer, "Stream open");
                let mut stream = response.into_inner();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        message = stream.message() => match message {
                            Ok(Some(message)) => on_message(message),
                            Ok(None) => {
                                tracing::debug!(peer = %peer, "Stream closed by peer");
                                break;
                            }
                            Err(status) => {
                                tracing::debug!(peer = %peer, error = %status, "Stream failed");
                                break;
                            }
                        },
                    }
                }
            }
            Err(status) => {
                tracing::trace!(peer = %peer, error = %status, "Dial failed");
            }
        }

        state.send_replace(ConnectionState::Disconnected);
        if token.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(jittered(config.redial_delay())) => {}
        }
    }

    state.send_replace(ConnectionState::Disconnected);
    tracing::debug!(peer = %peer, "Connection stopped");
}

/// A dispatcher's registration with the coordinator.
pub struct CoordinatorConnection {
    client: CoordinatorServiceClient<Channel>,
    state: watch::Receiver<ConnectionState>,
    token: CancellationToken,
}

impl CoordinatorConnection {
    /// Start registering `dispatcher`; roster pushes arrive on the returned
    /// receiver.
    pub fn open(
        url: &str,
        dispatcher: EndpointInfo,
        config: &ConnectionConfig,
        token: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatcherPush>)> {
        let client = CoordinatorServiceClient::new(lazy_channel(url, config)?);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let request = proto::RegisterRequest {
            endpoint: Some(dispatcher.into()),
        };
        let stream_client = client.clone();
        tokio::spawn(hold_stream(
            url.to_string(),
            config.clone(),
            token.clone(),
            state_tx,
            move || {
                let mut client = stream_client.clone();
                let request = request.clone();
                async move { client.register_dispatcher(request).await }
            },
            move |event: proto::DispatcherEvent| match DispatcherPush::try_from(event) {
                Ok(push) => {
                    let _ = push_tx.send(push);
                }
                Err(e) => tracing::warn!(error = %e, "Malformed coordinator push"),
            },
        ));

        Ok((
            Self {
                client,
                state,
                token,
            },
            push_rx,
        ))
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

#[async_trait]
impl CoordinatorLink for CoordinatorConnection {
    async fn update_job(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        priority: i32,
        task_count: u64,
    ) -> Result<()> {
        self.client
            .clone()
            .update_job(proto::UpdateJobRequest {
                dispatcher_id: dispatcher_id.to_string(),
                job_id: job_id.to_string(),
                priority,
                task_count,
            })
            .await?;
        Ok(())
    }

    async fn clear_job(&self, dispatcher_id: &str) -> Result<()> {
        self.client
            .clone()
            .clear_job(proto::ClearJobRequest {
                dispatcher_id: dispatcher_id.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn release_agent(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        agent_id: &str,
    ) -> Result<()> {
        self.client
            .clone()
            .release_agent(proto::ReleaseAgentRequest {
                dispatcher_id: dispatcher_id.to_string(),
                job_id: job_id.to_string(),
                agent_id: agent_id.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Keeps an agent registered with the coordinator until `token` is
/// cancelled.
pub fn register_agent(
    url: &str,
    agent: EndpointInfo,
    config: &ConnectionConfig,
    token: CancellationToken,
) -> Result<watch::Receiver<ConnectionState>> {
    let client = CoordinatorServiceClient::new(lazy_channel(url, config)?);
    let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
    let request = proto::RegisterRequest {
        endpoint: Some(agent.into()),
    };

    tokio::spawn(hold_stream(
        url.to_string(),
        config.clone(),
        token,
        state_tx,
        move || {
            let mut client = client.clone();
            let request = request.clone();
            async move { client.register_agent(request).await }
        },
        |notice: proto::CoordinatorNotice| {
            tracing::info!(coordinator = %notice.coordinator, "Registered with coordinator");
        },
    ));

    Ok(state)
}

/// A dispatcher's connection to one agent.
pub struct AgentConnection {
    agent: String,
    dispatcher_id: String,
    client: AgentServiceClient<Channel>,
    token: CancellationToken,
}

#[async_trait]
impl AgentChannel for AgentConnection {
    async fn initialize(&self, config: &Value) -> Result<InitializationResult> {
        let response = self
            .client
            .clone()
            .initialize(proto::InitializeRequest {
                dispatcher_id: self.dispatcher_id.clone(),
                config_json: convert::json_to_text(config)?,
            })
            .await?;
        Ok(response.into_inner().into())
    }

    async fn start_tasks(&self, tasks: &[TaskItem]) -> Result<Vec<TaskResult>> {
        let tasks = tasks
            .iter()
            .map(proto::TaskItem::try_from)
            .collect::<Result<Vec<_>>>()?;
        let response = self
            .client
            .clone()
            .start_tasks(proto::StartTasksRequest {
                dispatcher_id: self.dispatcher_id.clone(),
                tasks,
            })
            .await?;
        response
            .into_inner()
            .results
            .into_iter()
            .map(TaskResult::try_from)
            .collect()
    }

    fn close(&self) {
        tracing::debug!(agent = %self.agent, "Closing agent connection");
        self.token.cancel();
    }
}

/// Opens gRPC connections to agents.
pub struct GrpcAgentConnector {
    config: ConnectionConfig,
    token: CancellationToken,
}

impl GrpcAgentConnector {
    /// Connections stop when `token` (or their own close) is cancelled.
    pub fn new(config: ConnectionConfig, token: CancellationToken) -> Self {
        Self { config, token }
    }
}

impl AgentConnector for GrpcAgentConnector {
    fn connect(&self, agent: &EndpointInfo, dispatcher: &EndpointInfo) -> Result<AgentLink> {
        let client = AgentServiceClient::new(lazy_channel(&agent.rpc_url, &self.config)?);
        let token = self.token.child_token();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events) = mpsc::unbounded_channel();

        let request = proto::RegisterRequest {
            endpoint: Some(dispatcher.clone().into()),
        };
        let stream_client = client.clone();
        let agent_name = agent.name.clone();
        tokio::spawn(hold_stream(
            agent.name.clone(),
            self.config.clone(),
            token.clone(),
            state_tx,
            move || {
                let mut client = stream_client.clone();
                let request = request.clone();
                async move { client.attach(request).await }
            },
            move |event: proto::AgentEvent| match AgentPush::try_from(event) {
                Ok(push) => {
                    let _ = events_tx.send(push);
                }
                Err(e) => tracing::warn!(agent = %agent_name, error = %e, "Malformed agent push"),
            },
        ));

        let channel = AgentConnection {
            agent: agent.name.clone(),
            dispatcher_id: dispatcher.name.clone(),
            client,
            token,
        };

        Ok(AgentLink {
            channel: std::sync::Arc::new(channel),
            events,
            state,
        })
    }
}
