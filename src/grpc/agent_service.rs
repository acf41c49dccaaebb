use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::agent::Agent;
use crate::proto::agent_service_server::AgentService;
use crate::proto::{
    AgentEvent, InitializationResult, InitializeRequest, RegisterRequest, StartTasksRequest,
    StartTasksResponse,
};
use crate::registry::AgentPush;
use crate::task::TaskItem;

use super::{convert, forward};

type AgentEventStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<AgentEvent, Status>> + Send>>;

/// gRPC front of an agent
pub struct AgentServiceImpl {
    agent: Arc<Agent>,
    token: CancellationToken,
}

impl AgentServiceImpl {
    /// Open streams end when `token` is cancelled.
    pub fn new(agent: Arc<Agent>, token: CancellationToken) -> Self {
        Self { agent, token }
    }
}

#[tonic::async_trait]
impl AgentService for AgentServiceImpl {
    type AttachStream = AgentEventStream;

    async fn attach(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let dispatcher = convert::registered_endpoint(request.into_inner())?;
        let name = dispatcher.name.clone();
        tracing::debug!(dispatcher = %name, url = %dispatcher.rpc_url, "Dispatcher attaching");

        let connection = self.agent.attach(dispatcher);
        let connection_id = connection.id;
        let agent = self.agent.clone();
        let stream = forward(
            connection,
            self.token.clone(),
            |push: AgentPush| AgentEvent::try_from(&push),
            move || {
                agent.detach(&name, connection_id);
            },
        );

        Ok(Response::new(Box::pin(stream) as Self::AttachStream))
    }

    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> Result<Response<InitializationResult>, Status> {
        let req = request.into_inner();
        let config = convert::text_to_json(&req.config_json)?;
        let result = self.agent.initialize(&req.dispatcher_id, &config).await;
        Ok(Response::new(result.into()))
    }

    async fn start_tasks(
        &self,
        request: Request<StartTasksRequest>,
    ) -> Result<Response<StartTasksResponse>, Status> {
        let req = request.into_inner();
        let tasks = req
            .tasks
            .into_iter()
            .map(TaskItem::try_from)
            .collect::<crate::error::Result<Vec<_>>>()?;

        let started = self.agent.start_tasks(&req.dispatcher_id, tasks).await;
        let results = started
            .iter()
            .map(crate::proto::TaskResult::try_from)
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(Response::new(StartTasksResponse { results }))
    }
}
