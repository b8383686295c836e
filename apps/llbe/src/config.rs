use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "critical"];
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub robot: RobotConfig,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
}

/// Signaling backend the trunk connects to. Authentication is a JSON
/// `user:auth` message sent on every fresh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_cap_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "wss://be.tpbod.devya.sh:443".into(),
            username: "llbe".into(),
            password: "changeme".into(),
            connect_timeout_ms: 10_000,
            backoff_floor_ms: 1_000,
            backoff_cap_ms: 15_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backoff_floor(&self) -> Duration {
        Duration::from_millis(self.backoff_floor_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub certificate_file: Option<PathBuf>,
    pub private_key_file: Option<PathBuf>,
    /// Generate a throwaway certificate instead of loading one. Development only.
    pub self_signed: bool,
    pub cipher_suites: Vec<String>,
    pub verify_client: bool,
    /// Echo every datagram back (demo mode). When off, datagrams are
    /// treated as wire frames and forwarded to the robot.
    pub echo: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".into(),
            port: 4433,
            max_connections: 50,
            handshake_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            reap_interval_ms: 5_000,
            certificate_file: Some(PathBuf::from("server.crt")),
            private_key_file: Some(PathBuf::from("server.key")),
            self_signed: false,
            cipher_suites: Vec::new(),
            verify_client: false,
            echo: true,
        }
    }
}

impl TransportConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub bind_address: String,
    pub robot_address: String,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:0".into(),
            robot_address: "192.168.4.1:5005".into(),
            heartbeat_interval_ms: 1_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl RobotConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
    pub console_output: bool,
    pub enable_file_logging: bool,
    pub metrics_listen: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: PathBuf::from("llbe.log"),
            console_output: true,
            enable_file_logging: false,
            metrics_listen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    pub ice_timeout_ms: u64,
    pub enable_datachannel: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.into()],
            turn_servers: Vec::new(),
            ice_timeout_ms: 10_000,
            enable_datachannel: true,
        }
    }
}

impl WebRtcConfig {
    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = self.to_json_string()?;
        fs::write(path, json + "\n").map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of {}, got {:?}",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }

        let url = Url::parse(&self.server.address)
            .map_err(|err| invalid(format!("server.address {:?}: {err}", self.server.address)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!(
                "server.address must be a ws:// or wss:// URL, got {:?}",
                self.server.address
            )));
        }
        if self.server.backoff_floor_ms == 0 {
            return Err(invalid("server.backoff_floor_ms must be positive"));
        }
        if self.server.backoff_floor_ms > self.server.backoff_cap_ms {
            return Err(invalid("server.backoff_floor_ms exceeds server.backoff_cap_ms"));
        }
        positive("server.connect_timeout_ms", self.server.connect_timeout_ms)?;
        positive("server.poll_interval_ms", self.server.poll_interval_ms)?;

        if self.transport.enabled {
            if self.transport.max_connections == 0 {
                return Err(invalid("transport.max_connections must be positive"));
            }
            positive(
                "transport.handshake_timeout_ms",
                self.transport.handshake_timeout_ms,
            )?;
            positive("transport.poll_interval_ms", self.transport.poll_interval_ms)?;
            positive("transport.reap_interval_ms", self.transport.reap_interval_ms)?;
            if !self.transport.self_signed
                && (self.transport.certificate_file.is_none()
                    || self.transport.private_key_file.is_none())
            {
                return Err(invalid(
                    "transport needs certificate_file and private_key_file unless self_signed is set",
                ));
            }
        }

        socket_addr("robot.bind_address", &self.robot.bind_address)?;
        socket_addr("robot.robot_address", &self.robot.robot_address)?;
        positive("robot.heartbeat_interval_ms", self.robot.heartbeat_interval_ms)?;
        positive("robot.poll_interval_ms", self.robot.poll_interval_ms)?;

        if let Some(listen) = &self.logging.metrics_listen {
            socket_addr("logging.metrics_listen", listen)?;
        }

        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Applies `LLBE_*` overrides read through `lookup`. Values that do not
    /// parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup("LLBE_SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(password) = lookup("LLBE_SERVER_PASSWORD") {
            self.server.password = password;
        }
        if let Some(level) = lookup("LLBE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(port) = lookup("LLBE_TRANSPORT_PORT").and_then(|val| val.parse().ok()) {
            self.transport.port = port;
        }
        if let Some(robot) = lookup("LLBE_ROBOT_ADDRESS") {
            self.robot.robot_address = robot;
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(format!("{field} must be positive")));
    }
    Ok(())
}

fn socket_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|err| invalid(format!("{field} {value:?}: {err}")))
}
