//! Conversions between protobuf messages and domain types. Opaque payloads
//! travel as JSON text; an empty string stands for `null`.

use serde_json::Value;

use crate::error::{Result, TaskGridError};
use crate::proto;
use crate::proto::agent_event::Event as AgentEventKind;
use crate::proto::dispatcher_event::Event as DispatcherEventKind;
use crate::registry::{AgentPush, DispatcherPush};
use crate::task::{EndpointInfo, InitializationResult, TaskItem, TaskResult};

pub fn json_to_text(value: &Value) -> Result<String> {
    if value.is_null() {
        return Ok(String::new());
    }
    Ok(serde_json::to_string(value)?)
}

pub fn text_to_json(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

fn optional_message(message: String) -> Option<String> {
    (!message.is_empty()).then_some(message)
}

impl From<EndpointInfo> for proto::EndpointInfo {
    fn from(info: EndpointInfo) -> Self {
        Self {
            name: info.name,
            rpc_url: info.rpc_url,
            web_url: info.web_url,
        }
    }
}

impl From<proto::EndpointInfo> for EndpointInfo {
    fn from(info: proto::EndpointInfo) -> Self {
        EndpointInfo::new(info.name, info.rpc_url, info.web_url)
    }
}

/// Endpoint carried by a registration request; the name must be present.
pub fn registered_endpoint(request: proto::RegisterRequest) -> Result<EndpointInfo> {
    let endpoint = request
        .endpoint
        .ok_or_else(|| TaskGridError::InvalidPayload("missing endpoint".to_string()))?;
    if endpoint.name.is_empty() {
        return Err(TaskGridError::InvalidPayload("empty endpoint name".to_string()));
    }
    Ok(endpoint.into())
}

impl TryFrom<&TaskItem> for proto::TaskItem {
    type Error = TaskGridError;

    fn try_from(task: &TaskItem) -> Result<Self> {
        Ok(Self {
            identifier: task.identifier.clone(),
            data_json: json_to_text(&task.data)?,
        })
    }
}

impl TryFrom<proto::TaskItem> for TaskItem {
    type Error = TaskGridError;

    fn try_from(task: proto::TaskItem) -> Result<Self> {
        Ok(TaskItem::new(task.identifier, text_to_json(&task.data_json)?))
    }
}

impl TryFrom<&TaskResult> for proto::TaskResult {
    type Error = TaskGridError;

    fn try_from(result: &TaskResult) -> Result<Self> {
        Ok(Self {
            success: result.success,
            error_message: result.error_message.clone().unwrap_or_default(),
            data_json: json_to_text(&result.data)?,
        })
    }
}

impl TryFrom<proto::TaskResult> for TaskResult {
    type Error = TaskGridError;

    fn try_from(result: proto::TaskResult) -> Result<Self> {
        Ok(TaskResult {
            success: result.success,
            error_message: optional_message(result.error_message),
            data: text_to_json(&result.data_json)?,
        })
    }
}

impl From<InitializationResult> for proto::InitializationResult {
    fn from(result: InitializationResult) -> Self {
        Self {
            success: result.success,
            error_message: result.error_message.unwrap_or_default(),
            capacity: result.capacity,
        }
    }
}

impl From<proto::InitializationResult> for InitializationResult {
    fn from(result: proto::InitializationResult) -> Self {
        InitializationResult {
            success: result.success,
            error_message: optional_message(result.error_message),
            capacity: result.capacity,
        }
    }
}

impl From<DispatcherPush> for proto::DispatcherEvent {
    fn from(push: DispatcherPush) -> Self {
        let event = match push {
            DispatcherPush::EndpointAdded(info) => {
                DispatcherEventKind::EndpointAdded(proto::EndpointAdded {
                    endpoint: Some(info.into()),
                })
            }
            DispatcherPush::EndpointRemoved(name) => {
                DispatcherEventKind::EndpointRemoved(proto::EndpointRemoved { name })
            }
            DispatcherPush::EndpointListUpdated(infos) => {
                DispatcherEventKind::EndpointListUpdated(proto::EndpointListUpdated {
                    endpoints: infos.into_iter().map(Into::into).collect(),
                })
            }
        };
        Self { event: Some(event) }
    }
}

impl TryFrom<proto::DispatcherEvent> for DispatcherPush {
    type Error = TaskGridError;

    fn try_from(event: proto::DispatcherEvent) -> Result<Self> {
        match event.event {
            Some(DispatcherEventKind::EndpointAdded(added)) => {
                let endpoint = added
                    .endpoint
                    .ok_or_else(|| TaskGridError::InvalidPayload("missing endpoint".to_string()))?;
                Ok(DispatcherPush::EndpointAdded(endpoint.into()))
            }
            Some(DispatcherEventKind::EndpointRemoved(removed)) => {
                Ok(DispatcherPush::EndpointRemoved(removed.name))
            }
            Some(DispatcherEventKind::EndpointListUpdated(list)) => Ok(
                DispatcherPush::EndpointListUpdated(list.endpoints.into_iter().map(Into::into).collect()),
            ),
            None => Err(TaskGridError::InvalidPayload("empty dispatcher event".to_string())),
        }
    }
}

impl TryFrom<&AgentPush> for proto::AgentEvent {
    type Error = TaskGridError;

    fn try_from(push: &AgentPush) -> Result<Self> {
        let event = match push {
            AgentPush::SetAgentState { agent_id, active } => {
                AgentEventKind::SetAgentState(proto::SetAgentState {
                    agent_id: agent_id.clone(),
                    active: *active,
                })
            }
            AgentPush::TaskCompleted { task, result } => {
                AgentEventKind::TaskCompleted(proto::TaskCompleted {
                    task: Some(task.try_into()?),
                    result: Some(result.try_into()?),
                })
            }
        };
        Ok(Self { event: Some(event) })
    }
}

impl TryFrom<proto::AgentEvent> for AgentPush {
    type Error = TaskGridError;

    fn try_from(event: proto::AgentEvent) -> Result<Self> {
        match event.event {
            Some(AgentEventKind::SetAgentState(state)) => Ok(AgentPush::SetAgentState {
                agent_id: state.agent_id,
                active: state.active,
            }),
            Some(AgentEventKind::TaskCompleted(completed)) => {
                let task = completed
                    .task
                    .ok_or_else(|| TaskGridError::InvalidPayload("missing task".to_string()))?;
                let result = completed
                    .result
                    .ok_or_else(|| TaskGridError::InvalidPayload("missing result".to_string()))?;
                Ok(AgentPush::TaskCompleted {
                    task: task.try_into()?,
                    result: result.try_into()?,
                })
            }
            None => Err(TaskGridError::InvalidPayload("empty agent event".to_string())),
        }
    }
}
