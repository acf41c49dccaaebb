//! Server-side mapping from logical peer names to their live connections.
//!
//! A peer may hold several connections at once (a redial can overlap the old
//! stream). The endpoint exists from its first connection until its last one
//! closes; [`EndpointRegistry::connect`] and [`EndpointRegistry::disconnect`]
//! report those edges so callers can fire added/removed handling exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{Result, TaskGridError};
use crate::task::{EndpointInfo, TaskItem, TaskResult};

/// Pushes a coordinator sends to a dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherPush {
    EndpointAdded(EndpointInfo),
    EndpointRemoved(String),
    EndpointListUpdated(Vec<EndpointInfo>),
}

/// Pushes an agent sends to a dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentPush {
    SetAgentState { agent_id: String, active: bool },
    TaskCompleted { task: TaskItem, result: TaskResult },
}

/// A freshly registered connection.
pub struct Connection<M> {
    pub id: u64,
    /// True when this is the endpoint's first live connection
    pub first: bool,
    pub receiver: mpsc::UnboundedReceiver<M>,
}

struct Endpoint<M> {
    info: EndpointInfo,
    connections: HashMap<u64, mpsc::UnboundedSender<M>>,
}

pub struct EndpointRegistry<M> {
    endpoints: Mutex<HashMap<String, Endpoint<M>>>,
    next_connection: AtomicU64,
}

impl<M> Default for EndpointRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EndpointRegistry<M> {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Endpoint<M>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection for `info.name`. The latest reported info wins.
    pub fn connect(&self, info: EndpointInfo) -> Connection<M> {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut endpoints = self.lock();
        let endpoint = endpoints
            .entry(info.name.clone())
            .or_insert_with(|| Endpoint {
                info: info.clone(),
                connections: HashMap::new(),
            });
        let first = endpoint.connections.is_empty();
        endpoint.info = info;
        endpoint.connections.insert(id, sender);

        tracing::debug!(endpoint = %endpoint.info.name, connection = id, first, "Connection registered");

        Connection {
            id,
            first,
            receiver,
        }
    }

    /// Drop one connection. Returns true when it was the endpoint's last.
    pub fn disconnect(&self, name: &str, connection_id: u64) -> bool {
        let mut endpoints = self.lock();
        let Some(endpoint) = endpoints.get_mut(name) else {
            return false;
        };
        if endpoint.connections.remove(&connection_id).is_none() {
            return false;
        }
        if endpoint.connections.is_empty() {
            endpoints.remove(name);
            tracing::debug!(endpoint = name, connection = connection_id, "Endpoint removed");
            true
        } else {
            false
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<EndpointInfo> {
        self.lock().get(name).map(|e| e.info.clone())
    }

    /// All connected endpoints, sorted by name.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut infos: Vec<EndpointInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve a typed push handle for a connected endpoint.
    pub fn peer(&self, name: &str) -> Result<PeerHandle<M>> {
        let endpoints = self.lock();
        let endpoint = endpoints
            .get(name)
            .ok_or_else(|| TaskGridError::UnknownEndpoint(name.to_string()))?;
        Ok(PeerHandle {
            name: name.to_string(),
            senders: endpoint.connections.values().cloned().collect(),
        })
    }
}

impl<M: Clone> EndpointRegistry<M> {
    /// Push to every connection of every endpoint.
    pub fn broadcast(&self, message: M) {
        let senders: Vec<mpsc::UnboundedSender<M>> = self
            .lock()
            .values()
            .flat_map(|e| e.connections.values().cloned())
            .collect();
        for sender in senders {
            let _ = sender.send(message.clone());
        }
    }
}

/// Push handle for every live connection of one named peer.
#[derive(Clone)]
pub struct PeerHandle<M> {
    name: String,
    senders: Vec<mpsc::UnboundedSender<M>>,
}

impl<M: Clone> PeerHandle<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver to all connections; fails only if none accepted the message.
    pub fn send(&self, message: M) -> Result<()> {
        let delivered = self
            .senders
            .iter()
            .filter(|s| s.send(message.clone()).is_ok())
            .count();
        if delivered == 0 {
            return Err(TaskGridError::UnknownEndpoint(self.name.clone()));
        }
        Ok(())
    }
}

/// Pushes a dispatcher accepts from the coordinator.
pub trait DispatcherPeer {
    fn endpoint_added(&self, info: EndpointInfo) -> Result<()>;
    fn endpoint_removed(&self, name: &str) -> Result<()>;
    fn endpoint_list_updated(&self, infos: Vec<EndpointInfo>) -> Result<()>;
}

impl DispatcherPeer for PeerHandle<DispatcherPush> {
    fn endpoint_added(&self, info: EndpointInfo) -> Result<()> {
        self.send(DispatcherPush::EndpointAdded(info))
    }

    fn endpoint_removed(&self, name: &str) -> Result<()> {
        self.send(DispatcherPush::EndpointRemoved(name.to_string()))
    }

    fn endpoint_list_updated(&self, infos: Vec<EndpointInfo>) -> Result<()> {
        self.send(DispatcherPush::EndpointListUpdated(infos))
    }
}

/// Pushes a dispatcher accepts from an agent.
pub trait AgentPeer {
    fn set_agent_state(&self, agent_id: &str, active: bool) -> Result<()>;
    fn complete_task(&self, task: TaskItem, result: TaskResult) -> Result<()>;
}

impl AgentPeer for PeerHandle<AgentPush> {
    fn set_agent_state(&self, agent_id: &str, active: bool) -> Result<()> {
        self.send(AgentPush::SetAgentState {
            agent_id: agent_id.to_string(),
            active,
        })
    }

    fn complete_task(&self, task: TaskItem, result: TaskResult) -> Result<()> {
        self.send(AgentPush::TaskCompleted { task, result })
    }
}
