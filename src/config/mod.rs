use crate::codec::WireFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TELEOP_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub drive: DriveConfig,
    pub bridge: BridgeConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            token: None,
        }
    }
}

/// Speeds used when mixing held arrow keys into a twist.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DriveConfig {
    /// m/s when driving straight.
    pub linear_speed: f64,
    /// rad/s when turning in place.
    pub angular_speed: f64,
    /// Applied to the linear speed while turning and driving at once.
    pub diagonal_linear_factor: f64,
    /// rad/s while turning and driving at once.
    pub diagonal_angular_speed: f64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            linear_speed: 0.26,
            angular_speed: 1.82,
            diagonal_linear_factor: 0.7,
            diagonal_angular_speed: 1.27,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub cmd_vel_topic: String,
    pub twist_type: String,
    pub connect_timeout_ms: u64,
    /// How long a robot whose rosbridge could not be reached is skipped
    /// before the next dial.
    pub reconnect_backoff_ms: u64,
    /// robot id -> rosbridge websocket url
    pub robots: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cmd_vel_topic: "/cmd_vel".to_string(),
            twist_type: "geometry_msgs/msg/Twist".to_string(),
            connect_timeout_ms: 3000,
            reconnect_backoff_ms: 1000,
            robots: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub wire_format: WireFormat,
    pub connect_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://127.0.0.1:8000".to_string(),
            token: None,
            wire_format: WireFormat::Json,
            connect_timeout_ms: 5000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("invalid {}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides()?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Server settings
        if let Ok(val) = env::var(format!("{}SERVER_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        // Drive settings
        if let Ok(val) = env::var(format!("{}LINEAR_SPEED", ENV_PREFIX)) {
            self.drive.linear_speed = val
                .parse()
                .map_err(|_| format!("{}LINEAR_SPEED must be a number", ENV_PREFIX))?;
        }
        if let Ok(val) = env::var(format!("{}ANGULAR_SPEED", ENV_PREFIX)) {
            self.drive.angular_speed = val
                .parse()
                .map_err(|_| format!("{}ANGULAR_SPEED must be a number", ENV_PREFIX))?;
        }

        // Bridge settings
        if let Ok(val) = env::var(format!("{}CMD_VEL_TOPIC", ENV_PREFIX)) {
            self.bridge.cmd_vel_topic = val;
        }

        // Client settings
        if let Ok(val) = env::var(format!("{}CLIENT_BASE_URL", ENV_PREFIX)) {
            self.client.base_url = val;
        }
        if let Ok(val) = env::var(format!("{}CLIENT_TOKEN", ENV_PREFIX)) {
            self.client.token = Some(val);
        }
        if let Ok(val) = env::var(format!("{}WIRE_FORMAT", ENV_PREFIX)) {
            self.client.wire_format = val.parse()?;
        }
        if let Ok(val) = env::var(format!("{}RETRY_ENABLED", ENV_PREFIX)) {
            self.client.retry.enabled = val.parse().unwrap_or(false);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.host.trim().is_empty() {
            return Err("server.host must be set".into());
        }

        let speeds = [
            ("drive.linear_speed", self.drive.linear_speed),
            ("drive.angular_speed", self.drive.angular_speed),
            ("drive.diagonal_angular_speed", self.drive.diagonal_angular_speed),
        ];
        for (name, value) in speeds {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a finite, non-negative number").into());
            }
        }
        let factor = self.drive.diagonal_linear_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return Err("drive.diagonal_linear_factor must be in (0, 1]".into());
        }

        if self.bridge.cmd_vel_topic.trim().is_empty() {
            return Err("bridge.cmd_vel_topic must be set".into());
        }
        if self.bridge.connect_timeout_ms == 0 {
            return Err("bridge.connect_timeout_ms must be non-zero".into());
        }
        for (robot, url) in &self.bridge.robots {
            if robot.trim().is_empty() {
                return Err("bridge.robots keys must be non-empty robot ids".into());
            }
            if !is_ws_url(url) {
                return Err(format!("bridge.robots.{robot} must be a ws:// or wss:// url").into());
            }
        }

        if !is_ws_url(&self.client.base_url) {
            return Err("client.base_url must be a ws:// or wss:// url".into());
        }
        if self.client.connect_timeout_ms == 0 {
            return Err("client.connect_timeout_ms must be non-zero".into());
        }
        let retry = &self.client.retry;
        if retry.enabled {
            if retry.max_attempts == 0 {
                return Err("client.retry.max_attempts must be >= 1 when retry is enabled".into());
            }
            if retry.initial_backoff_ms > retry.max_backoff_ms {
                return Err(
                    "client.retry.initial_backoff_ms must not exceed client.retry.max_backoff_ms"
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn is_ws_url(url: &str) -> bool {
    let url = url.trim();
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"));
    matches!(rest, Some(host) if !host.is_empty())
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".robot-teleop").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.drive, DriveConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let raw = r#"
            [server]
            port = 9100

            [bridge.robots]
            tb3-01 = "ws://10.0.0.5:9090"

            [client]
            wire_format = "msgpack"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.bridge.robots["tb3-01"], "ws://10.0.0.5:9090");
        assert_eq!(cfg.client.wire_format, WireFormat::Msgpack);
        assert_eq!(cfg.drive.linear_speed, 0.26);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_drive_values() {
        let mut cfg = Config::default();
        cfg.drive.linear_speed = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.drive.diagonal_linear_factor = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.drive.angular_speed = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_ws_urls() {
        let mut cfg = Config::default();
        cfg.client.base_url = "http://127.0.0.1:8000".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.bridge
            .robots
            .insert("tb3-01".to_string(), "10.0.0.5:9090".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_checks_retry_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.client.retry.max_attempts = 0;
        assert!(cfg.validate().is_ok());

        cfg.client.retry.enabled = true;
        assert!(cfg.validate().is_err());

        cfg.client.retry.max_attempts = 4;
        cfg.client.retry.initial_backoff_ms = 10_000;
        assert!(cfg.validate().is_err());

        cfg.client.retry.initial_backoff_ms = 250;
        assert!(cfg.validate().is_ok());
    }
}
