//! Client-side views of remote peers.
//!
//! The dispatcher core talks to the coordinator and to agents only through
//! these traits; `grpc::connection` provides the network implementations and
//! the coordinator itself implements [`CoordinatorLink`] for in-process use.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::registry::AgentPush;
use crate::task::{EndpointInfo, InitializationResult, TaskItem, TaskResult};

/// State of an outbound redialing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Dispatcher → coordinator calls.
#[async_trait]
pub trait CoordinatorLink: Send + Sync {
    async fn update_job(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        priority: i32,
        task_count: u64,
    ) -> Result<()>;

    async fn clear_job(&self, dispatcher_id: &str) -> Result<()>;

    async fn release_agent(&self, dispatcher_id: &str, job_id: &str, agent_id: &str)
        -> Result<()>;
}

/// Dispatcher → agent calls.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn initialize(&self, config: &Value) -> Result<InitializationResult>;

    /// Results are positionally aligned with `tasks`.
    async fn start_tasks(&self, tasks: &[TaskItem]) -> Result<Vec<TaskResult>>;

    /// Stop redialing and drop the connection.
    fn close(&self);
}

/// Everything an agent proxy needs from one agent connection.
pub struct AgentLink {
    pub channel: Arc<dyn AgentChannel>,
    /// Agent → dispatcher pushes
    pub events: mpsc::UnboundedReceiver<AgentPush>,
    pub state: watch::Receiver<ConnectionState>,
}

/// Opens agent connections for the dispatcher's pool.
pub trait AgentConnector: Send + Sync {
    /// `dispatcher` is the identity the connection registers with.
    fn connect(&self, agent: &EndpointInfo, dispatcher: &EndpointInfo) -> Result<AgentLink>;
}
