//! Dispatcher-side session for one remote agent.
//!
//! Each proxy is an actor: every input (agent pushes, connection state,
//! active-job changes, completions of its own remote calls) is handled on one
//! task, so bookkeeping for an agent is serialized without a lock. Remote
//! calls are spawned and report back as messages, so the actor never waits on
//! the network.
//!
//! Lifecycle: `Uninitialized → Initializing → Ready → (Draining) →
//! Initializing | Disposed`. A proxy whose agent rejected the job or whose
//! reconnect budget ran out becomes `Released` and idles until disposed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::Result;
use crate::peer::{AgentChannel, AgentConnector, ConnectionState, CoordinatorLink};
use crate::registry::AgentPush;
use crate::task::{EndpointInfo, InitializationResult, TaskItem, TaskResult, TaskState};

use super::job::Job;

/// Shared dispatcher state every proxy needs.
#[derive(Clone)]
pub struct ProxyContext {
    pub dispatcher: EndpointInfo,
    pub active_job: watch::Receiver<Option<Arc<Job>>>,
    pub connector: Arc<dyn AgentConnector>,
    pub coordinator: Arc<dyn CoordinatorLink>,
    pub max_reconnect_attempts: u32,
    /// Delay before retrying an initialization that failed in transport
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProxyState {
    Uninitialized,
    Initializing,
    Ready,
    Draining,
    Released,
    Disposed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub agent: String,
    pub state: ProxyState,
    pub job: Option<String>,
    pub activated: bool,
    pub capacity: usize,
    pub pending: usize,
    pub active: usize,
    pub reconnect_attempts: u32,
    /// In-flight tasks, unconfirmed first
    pub tasks: Vec<(String, TaskState)>,
}

enum ProxyMessage {
    TasksAvailable,
    Initialized {
        generation: u64,
        result: Result<InitializationResult>,
    },
    TasksStarted {
        generation: u64,
        tasks: Vec<TaskItem>,
        result: Result<Vec<TaskResult>>,
    },
    Status(oneshot::Sender<ProxyStatus>),
    Dispose(oneshot::Sender<()>),
}

/// Handle to a running proxy. Dropping it disposes the proxy.
pub struct AgentProxy {
    info: EndpointInfo,
    tx: mpsc::UnboundedSender<ProxyMessage>,
}

impl AgentProxy {
    pub fn spawn(info: EndpointInfo, context: ProxyContext) -> Result<Self> {
        let link = context.connector.connect(&info, &context.dispatcher)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = ProxyActor {
            agent: info.clone(),
            context,
            channel: link.channel,
            self_tx: tx.clone(),
            state: ProxyState::Uninitialized,
            activated: false,
            job: None,
            generation: 0,
            capacity: 0,
            pending: Vec::new(),
            unsent: Vec::new(),
            active: Vec::new(),
            dialed: false,
            reconnect_attempts: 0,
        };
        tokio::spawn(actor.run(rx, link.events, link.state));

        tracing::info!(agent = %info.name, url = %info.rpc_url, "Agent proxy created");
        Ok(Self { info, tx })
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub async fn status(&self) -> Option<ProxyStatus> {
        let (tx, rx) = oneshot::channel();
        self.forward_status(tx);
        rx.await.ok()
    }

    pub(crate) fn forward_status(&self, reply: oneshot::Sender<ProxyStatus>) {
        let _ = self.tx.send(ProxyMessage::Status(reply));
    }

    /// Requeue in-flight work and close the connection. Idempotent.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ProxyMessage::Dispose(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        let (tx, _) = oneshot::channel();
        let _ = self.tx.send(ProxyMessage::Dispose(tx));
    }
}

struct ProxyActor {
    agent: EndpointInfo,
    context: ProxyContext,
    channel: Arc<dyn AgentChannel>,
    self_tx: mpsc::UnboundedSender<ProxyMessage>,
    state: ProxyState,
    activated: bool,
    /// Job the agent is initialized (or initializing) for
    job: Option<Arc<Job>>,
    /// Bumped whenever in-flight bookkeeping is reset; stale call results
    /// carry an older value
    generation: u64,
    capacity: usize,
    /// Sent to the agent, start not yet confirmed
    pending: Vec<TaskItem>,
    /// Subset of `pending` whose StartTasks call failed in transport
    unsent: Vec<TaskItem>,
    active: Vec<TaskItem>,
    dialed: bool,
    reconnect_attempts: u32,
}

impl ProxyActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ProxyMessage>,
        mut events: mpsc::UnboundedReceiver<AgentPush>,
        mut connection: watch::Receiver<ConnectionState>,
    ) {
        let mut active_job = self.context.active_job.clone();
        let initial = *connection.borrow_and_update();
        self.on_connection_state(initial);

        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if !self.handle_message(msg) {
                        break;
                    }
                }
                Some(push) = events.recv() => self.handle_push(push),
                Ok(()) = active_job.changed() => self.request_tasks(),
                Ok(()) = connection.changed() => {
                    let state = *connection.borrow_and_update();
                    self.on_connection_state(state);
                }
            }
        }
    }

    fn handle_message(&mut self, msg: ProxyMessage) -> bool {
        match msg {
            ProxyMessage::TasksAvailable => self.request_tasks(),
            ProxyMessage::Initialized { generation, result } => {
                self.on_initialized(generation, result)
            }
            ProxyMessage::TasksStarted {
                generation,
                tasks,
                result,
            } => self.on_tasks_started(generation, tasks, result),
            ProxyMessage::Status(reply) => {
                let _ = reply.send(self.status());
            }
            ProxyMessage::Dispose(reply) => {
                self.dispose();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus {
            agent: self.agent.name.clone(),
            state: self.state,
            job: self.job.as_ref().map(|job| job.name().to_string()),
            activated: self.activated,
            capacity: self.capacity,
            pending: self.pending.len(),
            active: self.active.len(),
            reconnect_attempts: self.reconnect_attempts,
            tasks: self
                .pending
                .iter()
                .map(|t| (t.identifier.clone(), TaskState::Pending))
                .chain(
                    self.active
                        .iter()
                        .map(|t| (t.identifier.clone(), TaskState::Active)),
                )
                .collect(),
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, ProxyState::Released | ProxyState::Disposed)
    }

    fn handle_push(&mut self, push: AgentPush) {
        match push {
            AgentPush::SetAgentState { agent_id, active } => {
                if agent_id != self.agent.name {
                    tracing::debug!(agent = %self.agent.name, reported = %agent_id, "Agent reported a different id");
                }
                if active {
                    if !self.activated {
                        tracing::info!(agent = %self.agent.name, "Agent activated");
                    }
                    self.activated = true;
                    self.request_tasks();
                } else {
                    tracing::info!(agent = %self.agent.name, "Agent deactivated");
                    self.activated = false;
                    self.reset();
                }
            }
            AgentPush::TaskCompleted { task, result } => self.on_task_completed(task, result),
        }
    }

    /// Core scheduling step, run after anything that may free capacity.
    fn request_tasks(&mut self) {
        if self.is_finished() || !self.activated || self.state == ProxyState::Initializing {
            return;
        }

        let current = self.context.active_job.borrow().clone();
        let same_job = match (&self.job, &current) {
            (Some(ours), Some(theirs)) => Arc::ptr_eq(ours, theirs),
            (None, None) => true,
            _ => false,
        };

        if !same_job {
            if self.in_flight() > 0 {
                if self.state != ProxyState::Draining {
                    tracing::info!(
                        agent = %self.agent.name,
                        in_flight = self.in_flight(),
                        "Active job changed, draining before switch"
                    );
                    self.state = ProxyState::Draining;
                }
                return;
            }
            if let Some(previous) = self.job.take() {
                previous.unsubscribe(&self.agent.name);
            }
            self.state = ProxyState::Uninitialized;
            if let Some(job) = current {
                self.initialize(job);
            }
            return;
        }

        if self.state == ProxyState::Draining {
            self.state = ProxyState::Ready;
        }
        if self.state != ProxyState::Ready {
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };

        if !self.unsent.is_empty() {
            let batch = std::mem::take(&mut self.unsent);
            tracing::debug!(agent = %self.agent.name, tasks = batch.len(), "Resending tasks");
            self.send_batch(batch);
        }

        let queued = self.in_flight();
        if queued >= self.capacity {
            return;
        }

        let tx = self.self_tx.clone();
        let tasks = job.get_tasks(self.capacity - queued, &self.agent.name, move || {
            let _ = tx.send(ProxyMessage::TasksAvailable);
        });
        if tasks.is_empty() {
            return;
        }

        self.pending.extend(tasks.iter().cloned());
        self.send_batch(tasks);
    }

    fn initialize(&mut self, job: Arc<Job>) {
        self.generation += 1;
        self.job = Some(job.clone());
        self.state = ProxyState::Initializing;
        tracing::info!(agent = %self.agent.name, job = %job.name(), "Initializing agent");

        let channel = self.channel.clone();
        let tx = self.self_tx.clone();
        let generation = self.generation;
        let config = job.config().clone();
        tokio::spawn(async move {
            let result = channel.initialize(&config).await;
            let _ = tx.send(ProxyMessage::Initialized { generation, result });
        });
    }

    fn on_initialized(&mut self, generation: u64, result: Result<InitializationResult>) {
        if generation != self.generation || self.state != ProxyState::Initializing {
            tracing::debug!(agent = %self.agent.name, "Ignoring stale initialization result");
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };

        match result {
            Ok(init) if init.success => {
                self.capacity = init.capacity.max(1) as usize;
                self.state = ProxyState::Ready;
                tracing::info!(
                    agent = %self.agent.name,
                    job = %job.name(),
                    capacity = self.capacity,
                    "Agent ready"
                );
                self.request_tasks();
            }
            Ok(init) => {
                tracing::warn!(
                    agent = %self.agent.name,
                    job = %job.name(),
                    error = init.error_message.as_deref().unwrap_or("unknown"),
                    "Agent rejected job, releasing"
                );
                self.state = ProxyState::Released;
                self.release(&job);
            }
            Err(e) => {
                tracing::warn!(agent = %self.agent.name, job = %job.name(), error = %e, "Initialization call failed");
                self.job = None;
                self.state = ProxyState::Uninitialized;
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&self) {
        let tx = self.self_tx.clone();
        let delay = self.context.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ProxyMessage::TasksAvailable);
        });
    }

    fn send_batch(&self, tasks: Vec<TaskItem>) {
        let channel = self.channel.clone();
        let tx = self.self_tx.clone();
        let generation = self.generation;
        tracing::debug!(agent = %self.agent.name, tasks = tasks.len(), "Starting tasks");
        tokio::spawn(async move {
            let result = channel.start_tasks(&tasks).await;
            let _ = tx.send(ProxyMessage::TasksStarted {
                generation,
                tasks,
                result,
            });
        });
    }

    fn on_tasks_started(
        &mut self,
        generation: u64,
        tasks: Vec<TaskItem>,
        result: Result<Vec<TaskResult>>,
    ) {
        if generation != self.generation || self.is_finished() {
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };

        let results = match result {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(agent = %self.agent.name, tasks = tasks.len(), error = %e, "StartTasks failed, will resend");
                for task in tasks {
                    if self.pending.contains(&task) && !self.unsent.contains(&task) {
                        self.unsent.push(task);
                    }
                }
                self.schedule_retry();
                return;
            }
        };

        if results.len() != tasks.len() {
            tracing::warn!(
                agent = %self.agent.name,
                expected = tasks.len(),
                received = results.len(),
                "Start results misaligned"
            );
        }

        let mut failed = Vec::new();
        for (index, task) in tasks.into_iter().enumerate() {
            // completed early or requeued meanwhile
            let Some(position) = self.pending.iter().position(|t| *t == task) else {
                continue;
            };
            let task = self.pending.remove(position);
            let result = results
                .get(index)
                .cloned()
                .unwrap_or_else(|| TaskResult::failure("agent returned no start result"));
            if result.success {
                self.active.push(task);
            } else {
                failed.push((task, result));
            }
        }

        for (task, result) in failed {
            tracing::warn!(
                agent = %self.agent.name,
                task = %task.identifier,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Task failed to start"
            );
            job.complete_task(&task, &result);
        }

        self.request_tasks();
    }

    fn on_task_completed(&mut self, task: TaskItem, result: TaskResult) {
        if !matches!(self.state, ProxyState::Ready | ProxyState::Draining) {
            tracing::debug!(agent = %self.agent.name, task = %task.identifier, "Ignoring completion");
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };

        let task = if let Some(position) = self.active.iter().position(|t| *t == task) {
            self.active.remove(position)
        } else if let Some(position) = self.pending.iter().position(|t| *t == task) {
            self.unsent.retain(|t| *t != task);
            self.pending.remove(position)
        } else {
            tracing::debug!(agent = %self.agent.name, task = %task.identifier, "Completion for unknown task");
            return;
        };

        job.complete_task(&task, &result);
        self.request_tasks();
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        tracing::trace!(agent = %self.agent.name, state = %state, "Agent connection state");
        if self.is_finished() {
            return;
        }

        match state {
            ConnectionState::Connected => {
                self.dialed = true;
                if self.reconnect_attempts > 0 {
                    tracing::info!(agent = %self.agent.name, attempts = self.reconnect_attempts, "Agent reconnected");
                }
                self.reconnect_attempts = 0;
                self.request_tasks();
            }
            ConnectionState::Connecting => {
                if !self.dialed {
                    self.dialed = true;
                    return;
                }
                self.reconnect_attempts += 1;
                if self.reconnect_attempts > self.context.max_reconnect_attempts {
                    self.give_up();
                } else {
                    tracing::debug!(
                        agent = %self.agent.name,
                        attempt = self.reconnect_attempts,
                        "Reconnecting to agent"
                    );
                }
            }
            ConnectionState::Disconnected => {
                if self.in_flight() > 0 || self.job.is_some() {
                    tracing::warn!(agent = %self.agent.name, in_flight = self.in_flight(), "Agent connection lost");
                }
                self.activated = false;
                self.reset();
            }
        }
    }

    /// Requeue in-flight work and forget the current job so the next
    /// activation re-initializes the agent.
    fn reset(&mut self) {
        self.requeue_in_flight();
        if let Some(job) = self.job.take() {
            job.unsubscribe(&self.agent.name);
        }
        self.generation += 1;
        if !self.is_finished() {
            self.state = ProxyState::Uninitialized;
        }
    }

    fn requeue_in_flight(&mut self) {
        self.unsent.clear();
        let mut tasks = std::mem::take(&mut self.pending);
        tasks.append(&mut self.active);
        if tasks.is_empty() {
            return;
        }
        if let Some(job) = &self.job {
            tracing::info!(agent = %self.agent.name, job = %job.name(), tasks = tasks.len(), "Requeueing in-flight tasks");
            job.cancel_tasks(tasks);
        }
    }

    fn give_up(&mut self) {
        tracing::warn!(
            agent = %self.agent.name,
            attempts = self.reconnect_attempts,
            "Reconnect budget exhausted, releasing agent"
        );
        let job = self
            .job
            .clone()
            .or_else(|| self.context.active_job.borrow().clone());
        self.reset();
        self.state = ProxyState::Released;
        self.channel.close();
        if let Some(job) = job {
            self.release(&job);
        }
    }

    /// Ask the coordinator to take this agent away from `job`.
    fn release(&self, job: &Job) {
        let coordinator = self.context.coordinator.clone();
        let dispatcher_id = self.context.dispatcher.name.clone();
        let job_id = job.name().to_string();
        let agent_id = self.agent.name.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator
                .release_agent(&dispatcher_id, &job_id, &agent_id)
                .await
            {
                tracing::warn!(agent = %agent_id, job = %job_id, error = %e, "Release request failed");
            }
        });
    }

    fn dispose(&mut self) {
        if self.state == ProxyState::Disposed {
            return;
        }
        self.requeue_in_flight();
        if let Some(job) = self.job.take() {
            job.unsubscribe(&self.agent.name);
        }
        self.state = ProxyState::Disposed;
        self.channel.close();
        tracing::info!(agent = %self.agent.name, "Agent proxy disposed");
    }
}
