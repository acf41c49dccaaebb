use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::coordinator::Coordinator;
use crate::proto::coordinator_service_server::CoordinatorService;
use crate::proto::{
    Ack, ClearJobRequest, CoordinatorNotice, DispatcherEvent, RegisterRequest,
    ReleaseAgentRequest, UpdateJobRequest,
};
use crate::registry::DispatcherPush;
use crate::task::EndpointInfo;

use super::{convert, forward};

type DispatcherEventStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<DispatcherEvent, Status>> + Send>>;
type CoordinatorNoticeStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<CoordinatorNotice, Status>> + Send>>;

/// gRPC front of the coordinator
pub struct CoordinatorServiceImpl {
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
}

impl CoordinatorServiceImpl {
    /// Open streams end when `token` is cancelled.
    pub fn new(coordinator: Arc<Coordinator>, token: CancellationToken) -> Self {
        Self { coordinator, token }
    }
}

#[tonic::async_trait]
impl CoordinatorService for CoordinatorServiceImpl {
    type RegisterDispatcherStream = DispatcherEventStream;
    type RegisterAgentStream = CoordinatorNoticeStream;

    async fn register_dispatcher(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Self::RegisterDispatcherStream>, Status> {
        let info = convert::registered_endpoint(request.into_inner())?;
        let name = info.name.clone();
        tracing::debug!(dispatcher = %name, url = %info.rpc_url, "Dispatcher connecting");

        let connection = self.coordinator.connect_dispatcher(info);
        let connection_id = connection.id;
        let coordinator = self.coordinator.clone();
        let stream = forward(
            connection,
            self.token.clone(),
            |push: DispatcherPush| Ok(DispatcherEvent::from(push)),
            move || {
                coordinator.disconnect_dispatcher(&name, connection_id);
            },
        );

        Ok(Response::new(Box::pin(stream) as Self::RegisterDispatcherStream))
    }

    async fn register_agent(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Self::RegisterAgentStream>, Status> {
        let info = convert::registered_endpoint(request.into_inner())?;
        let name = info.name.clone();
        tracing::debug!(agent = %name, url = %info.rpc_url, "Agent connecting");

        let connection = self.coordinator.connect_agent(info);
        let connection_id = connection.id;
        let coordinator = self.coordinator.clone();
        let stream = forward(
            connection,
            self.token.clone(),
            |info: EndpointInfo| {
                Ok(CoordinatorNotice {
                    coordinator: info.name,
                })
            },
            move || {
                coordinator.disconnect_agent(&name, connection_id);
            },
        );

        Ok(Response::new(Box::pin(stream) as Self::RegisterAgentStream))
    }

    async fn update_job(&self, request: Request<UpdateJobRequest>) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.coordinator
            .update_job(&req.dispatcher_id, &req.job_id, req.priority, req.task_count)?;
        Ok(Response::new(Ack {}))
    }

    async fn clear_job(&self, request: Request<ClearJobRequest>) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.coordinator.clear_job(&req.dispatcher_id);
        Ok(Response::new(Ack {}))
    }

    async fn release_agent(
        &self,
        request: Request<ReleaseAgentRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        self.coordinator
            .release_agent(&req.dispatcher_id, &req.job_id, &req.agent_id);
        Ok(Response::new(Ack {}))
    }
}
