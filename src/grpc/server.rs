use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::agent::Agent;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::grpc::agent_service::AgentServiceImpl;
use crate::grpc::coordinator_service::CoordinatorServiceImpl;
use crate::proto::agent_service_server::AgentServiceServer;
use crate::proto::coordinator_service_server::CoordinatorServiceServer;

/// Bind `addr`. Port 0 picks a free port; see `local_addr` on the result.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Serve the coordinator RPCs on `listener` until `token` is cancelled.
pub async fn serve_coordinator(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, coordinator = %coordinator.info().name, "Starting coordinator gRPC server");

    Server::builder()
        .add_service(CoordinatorServiceServer::new(CoordinatorServiceImpl::new(
            coordinator,
            token.clone(),
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), token.cancelled_owned())
        .await?;

    tracing::info!(addr = ?addr, "Coordinator gRPC server stopped");
    Ok(())
}

/// Serve the agent RPCs on `listener` until `token` is cancelled.
pub async fn serve_agent(
    listener: TcpListener,
    agent: Arc<Agent>,
    token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, agent = %agent.name(), "Starting agent gRPC server");

    Server::builder()
        .add_service(AgentServiceServer::new(AgentServiceImpl::new(
            agent,
            token.clone(),
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), token.cancelled_owned())
        .await?;

    tracing::info!(addr = ?addr, "Agent gRPC server stopped");
    Ok(())
}
