use std::env;
use std::time::Duration;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Quiet period after the last negotiation-needed signal before an
    /// offer is sent.
    pub renegotiation_delay: Duration,
    /// Label of the data channel the receiving side opens on start.
    pub heartbeat_label: String,
    /// Payload written to every data channel once it opens.
    pub greeting: String,
    pub ice_servers: Vec<String>,
    /// Buffer of the connection notification broadcast.
    pub notify_capacity: usize,
}

impl MeshConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let renegotiation_delay = env::var("MESH_RENEGOTIATION_DELAY_MS")
            .ok()
            .and_then(|val| val.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.renegotiation_delay);
        let heartbeat_label =
            env::var("MESH_HEARTBEAT_LABEL").unwrap_or(defaults.heartbeat_label);
        let greeting = env::var("MESH_GREETING").unwrap_or(defaults.greeting);
        let ice_servers = if env::var("MESH_LOCALHOST_ONLY").is_ok() {
            Vec::new()
        } else {
            env::var("MESH_ICE_SERVERS")
                .map(|value| parse_ice_servers(&value))
                .unwrap_or(defaults.ice_servers)
        };
        let notify_capacity = env::var("MESH_NOTIFY_CAPACITY")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(defaults.notify_capacity);

        Self {
            renegotiation_delay,
            heartbeat_label,
            greeting,
            ice_servers,
            notify_capacity,
        }
    }

    /// Configuration without STUN/TURN servers.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_renegotiation_delay(mut self, delay: Duration) -> Self {
        self.renegotiation_delay = delay;
        self
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            renegotiation_delay: Duration::from_millis(100),
            heartbeat_label: "heartbeat".to_string(),
            greeting: "hello".to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            notify_capacity: 64,
        }
    }
}

fn parse_ice_servers(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}
