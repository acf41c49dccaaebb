//! Remote worker.
//!
//! Dispatchers attach to an agent when the coordinator assigns it to them.
//! Attached dispatchers wait in FIFO order; only the head is active. It is
//! told so with `SetAgentState(agent, true)`, and calls from any other
//! dispatcher are refused. When the head detaches the next one is
//! activated.

pub mod executor;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::registry::{AgentPeer, AgentPush, Connection, EndpointRegistry};
use crate::task::{EndpointInfo, InitializationResult, TaskItem, TaskResult};

pub use executor::{CompletionSink, ShellExecutor, ShellSettings, TaskExecutor};

pub fn endpoint_info(config: &AgentConfig, name: Option<String>) -> EndpointInfo {
    let name = name.unwrap_or_else(|| format!("agent_{}", Uuid::new_v4().simple()));
    EndpointInfo::new(name, config.rpc_url(), config.web_url())
}

pub struct Agent {
    info: EndpointInfo,
    capacity: u32,
    executor: Arc<dyn TaskExecutor>,
    dispatchers: Arc<EndpointRegistry<AgentPush>>,
    /// Attached dispatcher names; the front one is active
    queue: Mutex<VecDeque<String>>,
}

impl Agent {
    pub fn new(info: EndpointInfo, capacity: u32, executor: Arc<dyn TaskExecutor>) -> Arc<Self> {
        Arc::new(Self {
            info,
            capacity: capacity.max(1),
            executor,
            dispatchers: Arc::new(EndpointRegistry::new()),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active_dispatcher(&self) -> Option<String> {
        self.lock().front().cloned()
    }

    pub fn attached_dispatchers(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn is_active(&self, dispatcher_id: &str) -> bool {
        self.lock().front().is_some_and(|active| active == dispatcher_id)
    }

    fn send_state(&self, dispatcher_id: &str, active: bool) {
        let result = self
            .dispatchers
            .peer(dispatcher_id)
            .and_then(|peer| peer.set_agent_state(&self.info.name, active));
        if let Err(e) = result {
            tracing::debug!(dispatcher = dispatcher_id, active, error = %e, "State push not delivered");
        }
    }

    /// Register a dispatcher connection. The active dispatcher is
    /// (re)notified on every new connection.
    pub fn attach(&self, dispatcher: EndpointInfo) -> Connection<AgentPush> {
        let name = dispatcher.name.clone();
        let mut queue = self.lock();
        let connection = self.dispatchers.connect(dispatcher);
        if connection.first {
            queue.push_back(name.clone());
            tracing::info!(dispatcher = %name, position = queue.len(), "Dispatcher attached");
        }
        if queue.front() == Some(&name) {
            self.send_state(&name, true);
        }
        connection
    }

    pub fn detach(&self, dispatcher_id: &str, connection_id: u64) {
        let mut queue = self.lock();
        if !self.dispatchers.disconnect(dispatcher_id, connection_id) {
            return;
        }

        let was_active = queue.front().is_some_and(|d| d == dispatcher_id);
        queue.retain(|d| d != dispatcher_id);
        tracing::info!(dispatcher = dispatcher_id, "Dispatcher detached");

        if was_active {
            if let Some(next) = queue.front() {
                tracing::info!(dispatcher = %next, "Activating next dispatcher");
                self.send_state(next, true);
            }
        }
    }

    pub async fn initialize(&self, dispatcher_id: &str, config: &Value) -> InitializationResult {
        if !self.is_active(dispatcher_id) {
            tracing::warn!(dispatcher = dispatcher_id, "Initialize from inactive dispatcher");
            return InitializationResult::rejected(format!(
                "dispatcher {} is not active on {}",
                dispatcher_id, self.info.name
            ));
        }

        match self.executor.initialize(config).await {
            Ok(()) => {
                tracing::info!(dispatcher = dispatcher_id, capacity = self.capacity, "Initialized");
                InitializationResult::ready(self.capacity)
            }
            Err(e) => {
                tracing::warn!(dispatcher = dispatcher_id, error = %e, "Rejected job configuration");
                InitializationResult::rejected(e.to_string())
            }
        }
    }

    pub async fn start_tasks(&self, dispatcher_id: &str, tasks: Vec<TaskItem>) -> Vec<TaskResult> {
        if !self.is_active(dispatcher_id) {
            let message = format!("dispatcher {} is not active on {}", dispatcher_id, self.info.name);
            return tasks
                .iter()
                .map(|_| TaskResult::failure(message.clone()))
                .collect();
        }

        tracing::debug!(dispatcher = dispatcher_id, tasks = tasks.len(), "Starting tasks");
        let sink = self.completion_sink(dispatcher_id);
        self.executor.start_tasks(tasks, sink).await
    }

    /// Completions go back to the dispatcher that started the task.
    fn completion_sink(&self, dispatcher_id: &str) -> CompletionSink {
        let dispatchers = self.dispatchers.clone();
        let dispatcher_id = dispatcher_id.to_string();
        CompletionSink::new(move |task, result| {
            let delivered = dispatchers
                .peer(&dispatcher_id)
                .and_then(|peer| peer.complete_task(task, result));
            if let Err(e) = delivered {
                tracing::debug!(dispatcher = %dispatcher_id, error = %e, "Completion not delivered");
            }
        })
    }

    /// Tell the active dispatcher this agent is going away.
    pub fn shutdown(&self) {
        if let Some(active) = self.active_dispatcher() {
            self.send_state(&active, false);
        }
    }
}
