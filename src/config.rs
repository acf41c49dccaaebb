use std::net::SocketAddr;
use std::time::Duration;

/// Well-known ports, one RPC port and one display port per role.
pub mod ports {
    pub const COORDINATOR: u16 = 9000;
    pub const COORDINATOR_WEB: u16 = 9001;
    pub const DISPATCHER: u16 = 9010;
    pub const DISPATCHER_WEB: u16 = 9011;
    pub const AGENT: u16 = 9020;
    pub const AGENT_WEB: u16 = 9021;
}

/// Behaviour of outbound redialing connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay between a dropped connection and the next dial attempt
    pub redial_delay_ms: u64,
    /// Upper bound for establishing a channel
    pub connect_timeout_ms: u64,
    /// Consecutive reconnect attempts an agent proxy tolerates before it
    /// gives the agent back to the coordinator
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            redial_delay_ms: 1000,
            connect_timeout_ms: 2000,
            max_reconnect_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    pub fn redial_delay(&self) -> Duration {
        Duration::from_millis(self.redial_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "coordinator".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], ports::COORDINATOR)),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Coordinator URL (e.g. "http://127.0.0.1:9000")
    pub coordinator_url: String,
    /// Host this dispatcher advertises; used for loopback detection
    pub advertise_host: String,
    pub port: u16,
    pub web_port: u16,
    pub connection: ConnectionConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            coordinator_url: format!("http://127.0.0.1:{}", ports::COORDINATOR),
            advertise_host: "127.0.0.1".to_string(),
            port: ports::DISPATCHER,
            web_port: ports::DISPATCHER_WEB,
            connection: ConnectionConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_coordinator(mut self, url: impl Into<String>) -> Self {
        self.coordinator_url = url.into();
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    pub coordinator_url: String,
    /// Host this agent advertises to dispatchers and the coordinator
    pub advertise_host: String,
    pub web_port: u16,
    /// Concurrency limit advertised after a successful initialization
    pub capacity: u32,
    pub connection: ConnectionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], ports::AGENT)),
            coordinator_url: format!("http://127.0.0.1:{}", ports::COORDINATOR),
            advertise_host: "127.0.0.1".to_string(),
            web_port: ports::AGENT_WEB,
            capacity: 1,
            connection: ConnectionConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_coordinator(mut self, url: impl Into<String>) -> Self {
        self.coordinator_url = url.into();
        self
    }

    /// URL dispatchers use to reach this agent
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}", self.advertise_host, self.listen_addr.port())
    }

    pub fn web_url(&self) -> String {
        format!("http://{}:{}", self.advertise_host, self.web_port)
    }
}
