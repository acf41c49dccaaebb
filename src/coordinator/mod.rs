//! Central broker: tracks live dispatchers and agents and owns allocation.
//!
//! Allocator mutations run under one mutex. The resulting pushes are queued
//! to an outbox while that lock is still held, so every dispatcher observes
//! assignment changes in the order the allocator made them. The outbox pump
//! delivers them through the dispatcher registry.

pub mod allocator;

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::peer::CoordinatorLink;
use crate::registry::{Connection, DispatcherPeer, DispatcherPush, EndpointRegistry};
use crate::task::EndpointInfo;

pub use allocator::{AgentAllocator, AllocationEvent, AllocationSnapshot, JobView};

/// A push waiting for delivery to one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub dispatcher_id: String,
    pub push: DispatcherPush,
}

impl From<AllocationEvent> for Outbound {
    fn from(event: AllocationEvent) -> Self {
        match event {
            AllocationEvent::Assigned {
                dispatcher_id,
                agent,
            } => Outbound {
                dispatcher_id,
                push: DispatcherPush::EndpointAdded(agent),
            },
            AllocationEvent::Unassigned {
                dispatcher_id,
                agent,
            } => Outbound {
                dispatcher_id,
                push: DispatcherPush::EndpointRemoved(agent.name),
            },
        }
    }
}

pub struct Coordinator {
    info: EndpointInfo,
    allocator: Mutex<AgentAllocator>,
    dispatchers: EndpointRegistry<DispatcherPush>,
    /// Agents only receive the coordinator's identity on registration
    agents: EndpointRegistry<EndpointInfo>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let info = EndpointInfo::new(
            config.name.clone(),
            format!("http://{}", config.listen_addr),
            format!(
                "http://{}:{}",
                config.listen_addr.ip(),
                crate::config::ports::COORDINATOR_WEB
            ),
        );

        let coordinator = Arc::new(Self {
            info,
            allocator: Mutex::new(AgentAllocator::new()),
            dispatchers: EndpointRegistry::new(),
            agents: EndpointRegistry::new(),
            outbox,
        });

        (coordinator, outbox_rx)
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    fn lock(&self) -> MutexGuard<'_, AgentAllocator> {
        self.allocator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver queued pushes until cancelled.
    pub async fn run_outbox(
        self: Arc<Self>,
        mut outbox_rx: mpsc::UnboundedReceiver<Outbound>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(outbound) = outbox_rx.recv() => self.deliver(outbound),
                else => break,
            }
        }
        tracing::debug!("Coordinator outbox stopped");
    }

    fn deliver(&self, outbound: Outbound) {
        let Outbound {
            dispatcher_id,
            push,
        } = outbound;

        let peer = match self.dispatchers.peer(&dispatcher_id) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::debug!(dispatcher = %dispatcher_id, error = %e, "Dropping push");
                return;
            }
        };

        let result = match push {
            DispatcherPush::EndpointAdded(info) => peer.endpoint_added(info),
            DispatcherPush::EndpointRemoved(name) => peer.endpoint_removed(&name),
            DispatcherPush::EndpointListUpdated(infos) => peer.endpoint_list_updated(infos),
        };
        if let Err(e) = result {
            tracing::debug!(dispatcher = %dispatcher_id, error = %e, "Push not delivered");
        }
    }

    fn enqueue(&self, events: Vec<AllocationEvent>) {
        for event in events {
            let _ = self.outbox.send(event.into());
        }
    }

    /// Register a dispatcher connection. Every connection, first or not,
    /// is sent the dispatcher's current agent roster.
    pub fn connect_dispatcher(&self, info: EndpointInfo) -> Connection<DispatcherPush> {
        let mut allocator = self.lock();
        let name = info.name.clone();
        let connection = self.dispatchers.connect(info.clone());
        if connection.first {
            allocator.add_dispatcher(&name, info);
        }
        let roster = allocator.assigned_agents(&name);
        let _ = self.outbox.send(Outbound {
            dispatcher_id: name,
            push: DispatcherPush::EndpointListUpdated(roster),
        });
        connection
    }

    pub fn disconnect_dispatcher(&self, name: &str, connection_id: u64) {
        let mut allocator = self.lock();
        if self.dispatchers.disconnect(name, connection_id) {
            let events = allocator.remove_dispatcher(name);
            self.enqueue(events);
        }
    }

    /// Register an agent connection and greet it with the coordinator's
    /// identity.
    pub fn connect_agent(&self, info: EndpointInfo) -> Connection<EndpointInfo> {
        let mut allocator = self.lock();
        let name = info.name.clone();
        let connection = self.agents.connect(info.clone());
        if connection.first {
            let events = allocator.add_agent(&name, info);
            self.enqueue(events);
        }
        if let Ok(peer) = self.agents.peer(&name) {
            let _ = peer.send(self.info.clone());
        }
        connection
    }

    pub fn disconnect_agent(&self, name: &str, connection_id: u64) {
        let mut allocator = self.lock();
        if self.agents.disconnect(name, connection_id) {
            let events = allocator.remove_agent(name);
            self.enqueue(events);
        }
    }

    pub fn update_job(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        priority: i32,
        task_count: u64,
    ) -> Result<()> {
        let mut allocator = self.lock();
        match allocator.update_job(dispatcher_id, job_id, priority, task_count) {
            Ok(events) => {
                self.enqueue(events);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(dispatcher = dispatcher_id, job = job_id, error = %e, "Rejected job update");
                Err(e)
            }
        }
    }

    pub fn clear_job(&self, dispatcher_id: &str) {
        let mut allocator = self.lock();
        let events = allocator.clear_job(dispatcher_id);
        self.enqueue(events);
    }

    pub fn release_agent(&self, dispatcher_id: &str, job_id: &str, agent_id: &str) {
        let mut allocator = self.lock();
        let events = allocator.release_agent(dispatcher_id, job_id, agent_id);
        self.enqueue(events);
    }

    pub fn snapshot(&self) -> AllocationSnapshot {
        self.lock().snapshot()
    }

    pub fn connected_agents(&self) -> Vec<EndpointInfo> {
        self.agents.endpoints()
    }

    pub fn connected_dispatchers(&self) -> Vec<EndpointInfo> {
        self.dispatchers.endpoints()
    }
}

#[async_trait]
impl CoordinatorLink for Coordinator {
    async fn update_job(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        priority: i32,
        task_count: u64,
    ) -> Result<()> {
        Coordinator::update_job(self, dispatcher_id, job_id, priority, task_count)
    }

    async fn clear_job(&self, dispatcher_id: &str) -> Result<()> {
        Coordinator::clear_job(self, dispatcher_id);
        Ok(())
    }

    async fn release_agent(
        &self,
        dispatcher_id: &str,
        job_id: &str,
        agent_id: &str,
    ) -> Result<()> {
        Coordinator::release_agent(self, dispatcher_id, job_id, agent_id);
        Ok(())
    }
}
