//! Job producer: owns submitted jobs and drives assigned agents.
//!
//! At most one job is active. Others wait in a heap ordered by priority
//! (FIFO among equals) and are promoted when the active one completes. The
//! active job is published on a watch channel that every agent proxy follows.

pub mod agent_proxy;
pub mod job;
pub mod pool;
pub mod provider;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConnectionConfig, DispatcherConfig};
use crate::error::{Result, TaskGridError};
use crate::peer::{AgentConnector, CoordinatorLink};
use crate::registry::DispatcherPush;
use crate::task::EndpointInfo;

pub use agent_proxy::{AgentProxy, ProxyContext, ProxyState, ProxyStatus};
pub use job::{Job, JobEvent, JobStats};
pub use pool::AgentPool;
pub use provider::{QueueTaskProvider, TaskFeed, TaskNotifier, TaskProvider};

/// Fresh dispatcher identity advertised to the coordinator and agents.
pub fn endpoint_info(config: &DispatcherConfig) -> EndpointInfo {
    EndpointInfo::new(
        format!("dispatcher_{}", Uuid::new_v4().simple()),
        format!("http://{}:{}", config.advertise_host, config.port),
        format!("http://{}:{}", config.advertise_host, config.web_port),
    )
}

struct WaitingJob {
    job: Arc<Job>,
    sequence: u64,
}

impl PartialEq for WaitingJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WaitingJob {}

impl PartialOrd for WaitingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitingJob {
    // max-heap: higher priority first, then earlier submission
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority()
            .cmp(&other.job.priority())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct Dispatcher {
    info: EndpointInfo,
    coordinator: Arc<dyn CoordinatorLink>,
    active: watch::Sender<Option<Arc<Job>>>,
    waiting: Mutex<BinaryHeap<WaitingJob>>,
    sequence: AtomicU64,
    pool: AgentPool,
    job_events: mpsc::UnboundedSender<JobEvent>,
    shut_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        info: EndpointInfo,
        coordinator: Arc<dyn CoordinatorLink>,
        connector: Arc<dyn AgentConnector>,
        connection: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<JobEvent>) {
        let (job_events, job_events_rx) = mpsc::unbounded_channel();
        let (active, active_rx) = watch::channel(None);

        let pool = AgentPool::new(ProxyContext {
            dispatcher: info.clone(),
            active_job: active_rx,
            connector,
            coordinator: coordinator.clone(),
            max_reconnect_attempts: connection.max_reconnect_attempts,
            retry_delay: connection.redial_delay(),
        });

        let dispatcher = Arc::new(Self {
            info,
            coordinator,
            active,
            waiting: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            pool,
            job_events,
            shut_down: AtomicBool::new(false),
        });

        (dispatcher, job_events_rx)
    }

    pub fn id(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn pool(&self) -> &AgentPool {
        &self.pool
    }

    pub fn active_job(&self) -> Option<Arc<Job>> {
        self.active.borrow().clone()
    }

    pub fn waiting_jobs(&self) -> usize {
        self.lock_waiting().len()
    }

    fn lock_waiting(&self) -> MutexGuard<'_, BinaryHeap<WaitingJob>> {
        self.waiting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a job. It becomes active immediately when nothing else runs.
    pub fn submit(&self, provider: Box<dyn TaskProvider>, priority: i32) -> Result<Arc<Job>> {
        if self.shut_down.load(AtomicOrdering::SeqCst) {
            return Err(TaskGridError::Disposed(self.info.name.clone()));
        }

        let job = Job::new(provider, priority, self.job_events.clone());
        let start_now = {
            let mut waiting = self.lock_waiting();
            let idle = self.active.borrow().is_none();
            if idle {
                self.active.send_replace(Some(job.clone()));
            } else {
                waiting.push(WaitingJob {
                    job: job.clone(),
                    sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                });
            }
            idle
        };

        tracing::info!(
            dispatcher = %self.info.name,
            job = %job.name(),
            priority,
            tasks = job.task_count(),
            queued = !start_now,
            "Job submitted"
        );
        if start_now {
            job.start();
        }
        Ok(job)
    }

    /// Pump job events and coordinator pushes until cancelled, then shut
    /// down.
    pub async fn run(
        self: Arc<Self>,
        mut job_events: mpsc::UnboundedReceiver<JobEvent>,
        mut coordinator_events: mpsc::UnboundedReceiver<DispatcherPush>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = job_events.recv() => self.handle_job_event(event).await,
                Some(push) = coordinator_events.recv() => self.handle_push(push).await,
            }
        }
        self.shutdown().await;
    }

    pub async fn handle_push(&self, push: DispatcherPush) {
        if self.shut_down.load(AtomicOrdering::SeqCst) {
            return;
        }
        match push {
            DispatcherPush::EndpointAdded(info) => {
                tracing::info!(dispatcher = %self.info.name, agent = %info.name, "Agent assigned");
                self.pool.add(info).await;
            }
            DispatcherPush::EndpointRemoved(name) => {
                tracing::info!(dispatcher = %self.info.name, agent = %name, "Agent unassigned");
                self.pool.remove(&name).await;
            }
            DispatcherPush::EndpointListUpdated(infos) => {
                tracing::info!(dispatcher = %self.info.name, agents = infos.len(), "Agent roster received");
                self.pool.update(infos).await;
                // a roster arrives on every (re)registration
                self.announce_active().await;
            }
        }
    }

    async fn handle_job_event(&self, event: JobEvent) {
        match event {
            JobEvent::Updated(name) => {
                if self.is_active(&name) {
                    self.announce_active().await;
                }
            }
            JobEvent::Completed(name) => self.promote_after(&name).await,
        }
    }

    fn is_active(&self, name: &str) -> bool {
        self.active
            .borrow()
            .as_ref()
            .is_some_and(|job| job.name() == name)
    }

    async fn announce_active(&self) {
        let Some(job) = self.active_job() else {
            return;
        };
        if job.is_completed() {
            return;
        }
        if let Err(e) = self
            .coordinator
            .update_job(&self.info.name, job.name(), job.priority(), job.task_count())
            .await
        {
            tracing::warn!(dispatcher = %self.info.name, job = %job.name(), error = %e, "Job update failed");
        }
    }

    /// Activate the next waiting job once `completed` finished.
    async fn promote_after(&self, completed: &str) {
        let next = {
            let mut waiting = self.lock_waiting();
            if !self.is_active(completed) {
                return;
            }
            let next = waiting.pop().map(|w| w.job);
            self.active.send_replace(next.clone());
            next
        };

        match next {
            Some(job) => {
                tracing::info!(dispatcher = %self.info.name, job = %job.name(), "Activating next job");
                job.start();
            }
            None => {
                tracing::info!(dispatcher = %self.info.name, "No jobs left");
                if let Err(e) = self.coordinator.clear_job(&self.info.name).await {
                    tracing::warn!(dispatcher = %self.info.name, error = %e, "Clear job failed");
                }
            }
        }
    }

    /// Dispose all agent proxies (requeueing their work) and withdraw from
    /// the coordinator. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        tracing::info!(dispatcher = %self.info.name, "Dispatcher shutting down");

        self.pool.clear().await;
        self.lock_waiting().clear();
        if let Err(e) = self.coordinator.clear_job(&self.info.name).await {
            tracing::debug!(dispatcher = %self.info.name, error = %e, "Clear job on shutdown failed");
        }
    }
}
