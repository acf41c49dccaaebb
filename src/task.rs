//! Types shared by the coordinator, dispatchers and agents.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tonic::transport::Uri;

/// One unit of work. Equality and hashing use the identifier only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub identifier: String,
    pub data: Value,
}

impl TaskItem {
    pub fn new(identifier: impl Into<String>, data: Value) -> Self {
        Self {
            identifier: identifier.into(),
            data,
        }
    }
}

impl PartialEq for TaskItem {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for TaskItem {}

impl Hash for TaskItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl std::fmt::Display for TaskItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub data: Value,
}

impl TaskResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            error_message: None,
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            data: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializationResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub capacity: u32,
}

impl InitializationResult {
    pub fn ready(capacity: u32) -> Self {
        Self {
            success: true,
            error_message: None,
            capacity,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            capacity: 0,
        }
    }
}

/// Lifecycle of a task on one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Active => write!(f, "active"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A named peer and the addresses it reported when it connected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    /// Address other peers use for RPC
    pub rpc_url: String,
    /// Display/web address
    pub web_url: String,
}

impl EndpointInfo {
    pub fn new(
        name: impl Into<String>,
        rpc_url: impl Into<String>,
        web_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rpc_url: rpc_url.into(),
            web_url: web_url.into(),
        }
    }

    /// Host portion of the RPC address, lowercased. Scheme, port and path
    /// are ignored.
    pub fn host(&self) -> String {
        host_of(&self.rpc_url)
    }

    /// True when both peers advertise the same host.
    pub fn is_loopback_of(&self, other: &EndpointInfo) -> bool {
        let host = self.host();
        !host.is_empty() && host == other.host()
    }
}

impl std::fmt::Display for EndpointInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Host part of an advertised address. Accepts full URLs and bare
/// "host:port" authorities; anything unparseable has no host.
pub fn host_of(address: &str) -> String {
    let parsed = if address.contains("://") {
        address.parse::<Uri>()
    } else {
        format!("http://{}", address).parse::<Uri>()
    };
    let Ok(uri) = parsed else {
        return String::new();
    };

    uri.host()
        .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn task_equality_uses_identifier() {
        let a = TaskItem::new("t1", json!("echo a"));
        let b = TaskItem::new("t1", json!("echo b"));
        let c = TaskItem::new("t2", json!("echo a"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<TaskItem> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn result_constructors() {
        let ok = TaskResult::success(json!({"out": 1}));
        assert!(ok.success);
        assert!(ok.error_message.is_none());

        let failed = TaskResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Active.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn host_parsing() {
        assert_eq!(host_of("http://10.0.0.5:9020"), "10.0.0.5");
        assert_eq!(host_of("https://Build-Box.local:443/rpc"), "build-box.local");
        assert_eq!(host_of("10.0.0.5:9020"), "10.0.0.5");
        assert_eq!(host_of("localhost"), "localhost");
        assert_eq!(host_of("http://[::1]:9000"), "::1");
        assert_eq!(host_of("http://user@host:1"), "host");
        assert_eq!(host_of("http://10.0.0.5?x=1"), "10.0.0.5");
        assert_eq!(host_of("http://10.0.0.5:9020/rpc?x=1#f"), "10.0.0.5");
        assert_eq!(host_of("http://10.0.0.5#f"), "10.0.0.5");
        assert_eq!(host_of("not a url"), "");
        assert_eq!(host_of(""), "");
    }

    #[test]
    fn loopback_ignores_scheme_and_port() {
        let agent = EndpointInfo::new("agent_1", "http://10.0.0.5:9020", "http://10.0.0.5:9021");
        let dispatcher = EndpointInfo::new("dispatcher_1", "https://10.0.0.5:9010", "");
        let remote = EndpointInfo::new("agent_2", "http://10.0.0.6:9020", "");
        assert!(agent.is_loopback_of(&dispatcher));
        assert!(!remote.is_loopback_of(&dispatcher));

        let with_query = EndpointInfo::new("agent_3", "http://10.0.0.5?x=1", "");
        assert!(with_query.is_loopback_of(&dispatcher));
    }

    #[test]
    fn empty_hosts_are_never_loopback() {
        let a = EndpointInfo::new("a", "", "");
        let b = EndpointInfo::new("b", "", "");
        assert!(!a.is_loopback_of(&b));
    }
}
