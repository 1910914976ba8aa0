use std::path::PathBuf;
use std::time::Duration;

/// Default broker socket.
pub const DEFAULT_SOCKET: &str = "/var/run/vtap/tap.sock";

/// Default bridge TAP devices are attached to.
pub const DEFAULT_BRIDGE: &str = "docker0";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_SESSIONS: usize = 64;

/// Runtime configuration of the broker daemon.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub bridge: String,
    /// How long a client may take to send its handshake.
    pub handshake_timeout: Duration,
    /// Upper bound for each kernel step and for the descriptor send.
    pub step_timeout: Duration,
    /// Sessions provisioned concurrently; further connections wait in the
    /// listen backlog.
    pub max_sessions: usize,
    /// Permissions applied to the socket file after binding.
    pub socket_mode: Option<u32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            bridge: DEFAULT_BRIDGE.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            socket_mode: None,
        }
    }
}
