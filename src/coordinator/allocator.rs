//! Fair-share agent allocation.
//!
//! The allocator owns the agent↔job table. Every job gets a quota
//! (`max_agents`) proportional to its share of the outstanding tasks, plus a
//! floor of one. Unsaturated jobs sit in a queue ordered by priority score;
//! free agents are handed to the head of that queue until it saturates or the
//! pool runs dry. Agents on the same host as a dispatcher are bound to that
//! dispatcher's job first.
//!
//! The allocator is a plain state machine: each operation returns the
//! [`AllocationEvent`]s it produced and the caller delivers them.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::error::{Result, TaskGridError};
use crate::task::EndpointInfo;

/// Notifications for the dispatcher that owns the affected job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationEvent {
    Assigned {
        dispatcher_id: String,
        agent: EndpointInfo,
    },
    Unassigned {
        dispatcher_id: String,
        agent: EndpointInfo,
    },
}

impl AllocationEvent {
    pub fn dispatcher_id(&self) -> &str {
        match self {
            AllocationEvent::Assigned { dispatcher_id, .. }
            | AllocationEvent::Unassigned { dispatcher_id, .. } => dispatcher_id,
        }
    }
}

#[derive(Debug)]
struct AgentRecord {
    info: EndpointInfo,
    job_id: Option<String>,
}

#[derive(Debug)]
struct DispatcherRecord {
    info: EndpointInfo,
    job_id: Option<String>,
}

#[derive(Debug)]
struct JobRecord {
    dispatcher_id: String,
    priority: i32,
    task_count: u64,
    priority_score: i64,
    max_agents: usize,
    /// Assignment order, oldest first
    agents: Vec<String>,
    /// Agents the dispatcher released from this job
    excluded: HashSet<String>,
}

impl JobRecord {
    fn has_room(&self) -> bool {
        self.agents.len() < self.max_agents
    }
}

/// Queue ordering: highest score first, job id as tie-breaker.
type QueueKey = (Reverse<i64>, String);

/// Score used to order unsaturated jobs. Priority dominates; larger jobs win
/// ties.
pub fn priority_score(priority: i32, task_count: u64) -> i64 {
    i64::from(priority) * 1000 + (task_count / 100) as i64
}

/// Quota for a job: its proportional share of the live agents, plus one.
/// A zero total gives every job the floor.
pub fn max_agents(live_agents: usize, task_count: u64, total_task_count: u64) -> usize {
    if total_task_count == 0 {
        return 1;
    }
    let share = (live_agents as u128 * task_count as u128) / total_task_count as u128;
    1 + usize::try_from(share).unwrap_or(usize::MAX - 1)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobView {
    pub id: String,
    pub dispatcher_id: String,
    pub priority: i32,
    pub task_count: u64,
    pub priority_score: i64,
    pub max_agents: usize,
    pub agents: Vec<String>,
    pub saturated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSnapshot {
    pub agents: Vec<(String, Option<String>)>,
    pub dispatchers: Vec<(String, Option<String>)>,
    pub jobs: Vec<JobView>,
    pub unassigned: Vec<String>,
    pub total_task_count: u64,
}

#[derive(Debug, Default)]
pub struct AgentAllocator {
    agents: HashMap<String, AgentRecord>,
    dispatchers: HashMap<String, DispatcherRecord>,
    jobs: HashMap<String, JobRecord>,
    unassigned: BTreeSet<String>,
    unsaturated: BTreeSet<QueueKey>,
    saturated: HashSet<String>,
    total_task_count: u64,
    events: Vec<AllocationEvent>,
}

impl AgentAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. A same-host dispatcher with an active job gets it
    /// directly; otherwise it joins the free pool.
    pub fn add_agent(&mut self, agent_id: &str, info: EndpointInfo) -> Vec<AllocationEvent> {
        if self.agents.contains_key(agent_id) {
            return Vec::new();
        }

        tracing::info!(agent = agent_id, host = %info.host(), "Agent registered");
        self.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                info,
                job_id: None,
            },
        );
        self.unassigned.insert(agent_id.to_string());

        match self.loopback_job_for(agent_id) {
            Some(job_id) => {
                tracing::info!(agent = agent_id, job = %job_id, "Loopback assignment");
                self.assign_agent(agent_id, Some(&job_id));
            }
            None => self.update_allocations(),
        }

        self.take_events()
    }

    /// Unassign and forget an agent. Unknown agents are ignored.
    pub fn remove_agent(&mut self, agent_id: &str) -> Vec<AllocationEvent> {
        if !self.agents.contains_key(agent_id) {
            return Vec::new();
        }

        self.assign_agent(agent_id, None);
        self.unassigned.remove(agent_id);
        self.agents.remove(agent_id);
        for job in self.jobs.values_mut() {
            job.excluded.remove(agent_id);
        }
        tracing::info!(agent = agent_id, "Agent removed");

        self.update_allocations();
        self.take_events()
    }

    pub fn add_dispatcher(&mut self, dispatcher_id: &str, info: EndpointInfo) {
        if self.dispatchers.contains_key(dispatcher_id) {
            return;
        }
        tracing::info!(dispatcher = dispatcher_id, host = %info.host(), "Dispatcher registered");
        self.dispatchers.insert(
            dispatcher_id.to_string(),
            DispatcherRecord { info, job_id: None },
        );
    }

    /// Forget a dispatcher, clearing its job first.
    pub fn remove_dispatcher(&mut self, dispatcher_id: &str) -> Vec<AllocationEvent> {
        if !self.dispatchers.contains_key(dispatcher_id) {
            return Vec::new();
        }
        self.clear_job_inner(dispatcher_id);
        self.dispatchers.remove(dispatcher_id);
        tracing::info!(dispatcher = dispatcher_id, "Dispatcher removed");

        self.update_allocations();
        self.take_events()
    }

    /// Insert or refresh the dispatcher's current job. A different job
    /// replaces the previous one, whose agents go back to the pool.
    pub fn update_job(
        &mut self,
        dispatcher_id: &str,
        job_id: &str,
        priority: i32,
        task_count: u64,
    ) -> Result<Vec<AllocationEvent>> {
        let previous = match self.dispatchers.get(dispatcher_id) {
            Some(dispatcher) => dispatcher.job_id.clone(),
            None => return Err(TaskGridError::UnknownDispatcher(dispatcher_id.to_string())),
        };
        if let Some(owner) = self.jobs.get(job_id).map(|j| j.dispatcher_id.clone()) {
            if owner != dispatcher_id {
                return Err(TaskGridError::InvalidPayload(format!(
                    "job {} belongs to dispatcher {}",
                    job_id, owner
                )));
            }
        }

        if previous.as_deref().is_some_and(|current| current != job_id) {
            self.clear_job_inner(dispatcher_id);
        }
        if let Some(dispatcher) = self.dispatchers.get_mut(dispatcher_id) {
            dispatcher.job_id = Some(job_id.to_string());
        }

        let live_agents = self.agents.len();
        let job = self
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord {
                dispatcher_id: dispatcher_id.to_string(),
                priority,
                task_count: 0,
                priority_score: 0,
                max_agents: 0,
                agents: Vec::new(),
                excluded: HashSet::new(),
            });

        self.unsaturated
            .remove(&(Reverse(job.priority_score), job_id.to_string()));
        self.saturated.remove(job_id);

        self.total_task_count = self
            .total_task_count
            .saturating_sub(job.task_count)
            .saturating_add(task_count);
        job.priority = priority;
        job.task_count = task_count;
        job.priority_score = priority_score(priority, task_count);
        job.max_agents = max_agents(live_agents, task_count, self.total_task_count);

        tracing::debug!(
            dispatcher = dispatcher_id,
            job = job_id,
            priority,
            task_count,
            score = job.priority_score,
            max_agents = job.max_agents,
            "Job updated"
        );

        self.rebucket(job_id);
        self.shed_surplus(job_id);
        self.bind_loopback_agents(dispatcher_id, job_id);
        self.update_allocations();

        Ok(self.take_events())
    }

    /// Remove the dispatcher's current job and free its agents.
    pub fn clear_job(&mut self, dispatcher_id: &str) -> Vec<AllocationEvent> {
        self.clear_job_inner(dispatcher_id);
        self.update_allocations();
        self.take_events()
    }

    /// Dispatcher-initiated release of one agent from one of its jobs. The
    /// agent is not offered to that job again while it lives.
    pub fn release_agent(
        &mut self,
        dispatcher_id: &str,
        job_id: &str,
        agent_id: &str,
    ) -> Vec<AllocationEvent> {
        let owned = self
            .jobs
            .get(job_id)
            .is_some_and(|job| job.dispatcher_id == dispatcher_id);
        if !owned {
            return Vec::new();
        }

        if let Some(job) = self.jobs.get_mut(job_id) {
            job.excluded.insert(agent_id.to_string());
        }

        let assigned_here = self
            .agents
            .get(agent_id)
            .is_some_and(|agent| agent.job_id.as_deref() == Some(job_id));
        if assigned_here {
            tracing::info!(dispatcher = dispatcher_id, job = job_id, agent = agent_id, "Agent released");
            self.assign_agent(agent_id, None);
            self.update_allocations();
        }

        self.take_events()
    }

    /// Agents currently working for a dispatcher, sorted by name.
    pub fn assigned_agents(&self, dispatcher_id: &str) -> Vec<EndpointInfo> {
        let Some(job_id) = self
            .dispatchers
            .get(dispatcher_id)
            .and_then(|d| d.job_id.as_ref())
        else {
            return Vec::new();
        };
        let mut infos: Vec<EndpointInfo> = self
            .jobs
            .get(job_id)
            .map(|job| {
                job.agents
                    .iter()
                    .filter_map(|id| self.agents.get(id).map(|a| a.info.clone()))
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn agent_job(&self, agent_id: &str) -> Option<String> {
        self.agents.get(agent_id).and_then(|a| a.job_id.clone())
    }

    pub fn dispatcher_job(&self, dispatcher_id: &str) -> Option<String> {
        self.dispatchers
            .get(dispatcher_id)
            .and_then(|d| d.job_id.clone())
    }

    pub fn job(&self, job_id: &str) -> Option<JobView> {
        self.jobs.get(job_id).map(|job| self.job_view(job_id, job))
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn unassigned_count(&self) -> usize {
        self.unassigned.len()
    }

    pub fn total_task_count(&self) -> u64 {
        self.total_task_count
    }

    pub fn snapshot(&self) -> AllocationSnapshot {
        let mut agents: Vec<(String, Option<String>)> = self
            .agents
            .iter()
            .map(|(id, a)| (id.clone(), a.job_id.clone()))
            .collect();
        agents.sort();
        let mut dispatchers: Vec<(String, Option<String>)> = self
            .dispatchers
            .iter()
            .map(|(id, d)| (id.clone(), d.job_id.clone()))
            .collect();
        dispatchers.sort();
        let mut jobs: Vec<JobView> = self
            .jobs
            .iter()
            .map(|(id, job)| self.job_view(id, job))
            .collect();
        jobs.sort_by(|a, b| b.priority_score.cmp(&a.priority_score).then(a.id.cmp(&b.id)));

        AllocationSnapshot {
            agents,
            dispatchers,
            jobs,
            unassigned: self.unassigned.iter().cloned().collect(),
            total_task_count: self.total_task_count,
        }
    }

    fn job_view(&self, id: &str, job: &JobRecord) -> JobView {
        JobView {
            id: id.to_string(),
            dispatcher_id: job.dispatcher_id.clone(),
            priority: job.priority,
            task_count: job.task_count,
            priority_score: job.priority_score,
            max_agents: job.max_agents,
            agents: job.agents.clone(),
            saturated: self.saturated.contains(id),
        }
    }

    fn take_events(&mut self) -> Vec<AllocationEvent> {
        std::mem::take(&mut self.events)
    }

    fn clear_job_inner(&mut self, dispatcher_id: &str) {
        let Some(job_id) = self
            .dispatchers
            .get_mut(dispatcher_id)
            .and_then(|d| d.job_id.take())
        else {
            return;
        };

        let agents = self
            .jobs
            .get(&job_id)
            .map(|job| job.agents.clone())
            .unwrap_or_default();
        for agent_id in agents.iter().rev() {
            self.assign_agent(agent_id, None);
        }

        if let Some(job) = self.jobs.remove(&job_id) {
            self.total_task_count = self.total_task_count.saturating_sub(job.task_count);
            self.unsaturated
                .remove(&(Reverse(job.priority_score), job_id.clone()));
            self.saturated.remove(&job_id);
        }
        tracing::info!(dispatcher = dispatcher_id, job = %job_id, "Job cleared");
    }

    /// The single mutation primitive: move an agent from its current job (if
    /// any) to `job_id` (or to the free pool).
    fn assign_agent(&mut self, agent_id: &str, job_id: Option<&str>) {
        let job_id = job_id.filter(|id| self.jobs.contains_key(*id));
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return;
        };
        if agent.job_id.as_deref() == job_id {
            return;
        }

        let previous = agent.job_id.take();
        agent.job_id = job_id.map(str::to_string);
        let info = agent.info.clone();

        match previous {
            Some(previous) => {
                if let Some(job) = self.jobs.get_mut(&previous) {
                    job.agents.retain(|id| id != agent_id);
                    let dispatcher_id = job.dispatcher_id.clone();
                    self.rebucket(&previous);
                    tracing::debug!(agent = agent_id, job = %previous, "Agent unassigned");
                    self.events.push(AllocationEvent::Unassigned {
                        dispatcher_id,
                        agent: info.clone(),
                    });
                }
            }
            None => {
                self.unassigned.remove(agent_id);
            }
        }

        match job_id {
            Some(job_id) => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.agents.push(agent_id.to_string());
                    let dispatcher_id = job.dispatcher_id.clone();
                    self.rebucket(job_id);
                    tracing::debug!(agent = agent_id, job = job_id, "Agent assigned");
                    self.events.push(AllocationEvent::Assigned {
                        dispatcher_id,
                        agent: info,
                    });
                }
            }
            None => {
                self.unassigned.insert(agent_id.to_string());
            }
        }
    }

    /// Place a job in the unsaturated queue or the saturated set.
    fn rebucket(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let key = (Reverse(job.priority_score), job_id.to_string());
        self.unsaturated.remove(&key);
        self.saturated.remove(job_id);
        if job.has_room() {
            self.unsaturated.insert(key);
        } else {
            self.saturated.insert(job_id.to_string());
        }
    }

    /// Unassign the most recently assigned agents of a job whose quota
    /// dropped below its assignment.
    fn shed_surplus(&mut self, job_id: &str) {
        loop {
            let surplus = match self.jobs.get(job_id) {
                Some(job) if job.agents.len() > job.max_agents => job.agents.last().cloned(),
                _ => None,
            };
            let Some(agent_id) = surplus else {
                break;
            };
            tracing::info!(agent = %agent_id, job = job_id, "Agent over quota, unassigning");
            self.assign_agent(&agent_id, None);
        }
    }

    /// First same-host dispatcher (by id) whose job can take this agent.
    fn loopback_job_for(&self, agent_id: &str) -> Option<String> {
        let agent = self.agents.get(agent_id)?;
        let mut candidates: Vec<(&String, &DispatcherRecord)> = self
            .dispatchers
            .iter()
            .filter(|(_, d)| d.job_id.is_some() && agent.info.is_loopback_of(&d.info))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(b.0));

        candidates.into_iter().find_map(|(_, d)| {
            let job_id = d.job_id.as_ref()?;
            let job = self.jobs.get(job_id)?;
            (job.has_room() && !job.excluded.contains(agent_id)).then(|| job_id.clone())
        })
    }

    /// Bind same-host agents to a dispatcher's job while it has room. Free
    /// agents go first; agents serving a dispatcher on another host are
    /// taken next.
    fn bind_loopback_agents(&mut self, dispatcher_id: &str, job_id: &str) {
        let Some(dispatcher) = self.dispatchers.get(dispatcher_id) else {
            return;
        };
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };

        let mut candidates: Vec<(bool, String)> = self
            .agents
            .iter()
            .filter(|(id, agent)| {
                agent.info.is_loopback_of(&dispatcher.info)
                    && agent.job_id.as_deref() != Some(job_id)
                    && !job.excluded.contains(*id)
            })
            .filter_map(|(id, agent)| match &agent.job_id {
                None => Some((false, id.clone())),
                Some(other) => {
                    let serves_remote = self
                        .jobs
                        .get(other)
                        .and_then(|j| self.dispatchers.get(&j.dispatcher_id))
                        .is_some_and(|d| !agent.info.is_loopback_of(&d.info));
                    serves_remote.then(|| (true, id.clone()))
                }
            })
            .collect();
        candidates.sort();

        for (_, agent_id) in candidates {
            if !self.jobs.get(job_id).is_some_and(JobRecord::has_room) {
                break;
            }
            tracing::info!(agent = %agent_id, job = job_id, "Loopback assignment");
            self.assign_agent(&agent_id, Some(job_id));
        }
    }

    /// Greedy highest-score-first fill of unsaturated jobs from the pool.
    fn update_allocations(&mut self) {
        if self.unassigned.is_empty() || self.unsaturated.is_empty() {
            return;
        }
        tracing::trace!(
            unassigned = self.unassigned.len(),
            unsaturated = self.unsaturated.len(),
            "Updating allocations"
        );

        let order: Vec<String> = self.unsaturated.iter().map(|(_, id)| id.clone()).collect();
        for job_id in order {
            if self.unassigned.is_empty() {
                break;
            }
            loop {
                let candidate = match self.jobs.get(&job_id) {
                    Some(job) if job.has_room() => self
                        .unassigned
                        .iter()
                        .find(|id| !job.excluded.contains(*id))
                        .cloned(),
                    _ => None,
                };
                match candidate {
                    Some(agent_id) => self.assign_agent(&agent_id, Some(&job_id)),
                    None => break,
                }
            }
        }
    }
}
