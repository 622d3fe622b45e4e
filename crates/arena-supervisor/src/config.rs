//! Supervisor configuration, read from `ARENA_*` environment variables.
//!
//! Loading goes through a lookup function so tests can pass a map instead
//! of the process environment. Any missing or malformed value is a
//! [`ConfigError`] and aborts startup.

use std::path::PathBuf;
use std::time::Duration;

use arena_core::{ConfigError, ConfigResult, HealthKind, Protocol, parse_duration};
use regex::Regex;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_SERVER_PORT: u16 = 9090;

/// How the supervisor decides the game server is usable.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub kind: HealthKind,
    /// Container port dialed by `port` checks.
    pub port: Option<u16>,
    pub protocol: Protocol,
    /// Compiled `log-pattern` expression.
    pub pattern: Option<Regex>,
    pub initial_delay: Duration,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            kind: HealthKind::None,
            port: None,
            protocol: Protocol::Tcp,
            pattern: None,
            initial_delay: Duration::ZERO,
            timeout: DEFAULT_HEALTH_TIMEOUT,
            interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_id: String,
    pub auth_token: String,
    /// Base URL of the control plane's internal API.
    pub api_url: String,
    /// Game server argv; `$VAR` references are expanded at start.
    pub command: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub grace_period: Duration,
    pub health: HealthSettings,
    pub heartbeat_interval: Duration,
    pub health_server_port: u16,
}

impl SupervisorConfig {
    /// Load from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve each variable.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));
        let duration = |key: &str, default: Duration| match get(key) {
            None => Ok(default),
            Some(value) => parse_duration(&value).ok_or(ConfigError::InvalidDuration {
                field: key.to_string(),
                value,
            }),
        };
        let port = |key: &str| -> ConfigResult<Option<u16>> {
            get(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u16>()
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or_else(|| invalid(key, format!("not a port number: {value:?}")))
                })
                .transpose()
        };

        let command_json = required("ARENA_START_COMMAND")?;
        let command: Vec<String> = serde_json::from_str(&command_json)
            .map_err(|e| invalid("ARENA_START_COMMAND", format!("expected a JSON array: {e}")))?;
        if command.first().is_none_or(|program| program.is_empty()) {
            return Err(invalid("ARENA_START_COMMAND", "command is empty".to_string()));
        }

        let kind = get("ARENA_HEALTH_TYPE")
            .map(|v| v.parse::<HealthKind>())
            .transpose()
            .map_err(|reason| invalid("ARENA_HEALTH_TYPE", reason))?
            .unwrap_or_default();
        let protocol = get("ARENA_HEALTH_PROTOCOL")
            .map(|v| v.parse::<Protocol>())
            .transpose()
            .map_err(|reason| invalid("ARENA_HEALTH_PROTOCOL", reason))?
            .unwrap_or_default();
        let pattern = get("ARENA_HEALTH_PATTERN")
            .map(|p| Regex::new(&p))
            .transpose()
            .map_err(|e| invalid("ARENA_HEALTH_PATTERN", e.to_string()))?;

        let health = HealthSettings {
            kind,
            port: port("ARENA_HEALTH_PORT")?,
            protocol,
            pattern,
            initial_delay: duration("ARENA_HEALTH_INITIAL_DELAY", Duration::ZERO)?,
            timeout: duration("ARENA_HEALTH_TIMEOUT", DEFAULT_HEALTH_TIMEOUT)?,
            interval: duration("ARENA_HEALTH_INTERVAL", DEFAULT_HEALTH_INTERVAL)?,
        };
        match health.kind {
            HealthKind::Port if health.port.is_none() => {
                return Err(ConfigError::Missing("ARENA_HEALTH_PORT".to_string()));
            }
            HealthKind::LogPattern if health.pattern.is_none() => {
                return Err(ConfigError::Missing("ARENA_HEALTH_PATTERN".to_string()));
            }
            _ => {}
        }
        if health.interval.is_zero() {
            return Err(invalid("ARENA_HEALTH_INTERVAL", "must be positive".to_string()));
        }

        let heartbeat_interval = duration("ARENA_HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL)?;
        if heartbeat_interval.is_zero() {
            return Err(invalid("ARENA_HEARTBEAT_INTERVAL", "must be positive".to_string()));
        }

        Ok(Self {
            server_id: required("ARENA_SERVER_ID")?,
            auth_token: required("ARENA_AUTH_TOKEN")?,
            api_url: required("ARENA_API_URL")?.trim_end_matches('/').to_string(),
            command,
            workdir: get("ARENA_WORKDIR").map(PathBuf::from),
            grace_period: duration("ARENA_GRACE_PERIOD", DEFAULT_GRACE_PERIOD)?,
            health,
            heartbeat_interval,
            health_server_port: port("ARENA_HEALTH_SERVER_PORT")?
                .unwrap_or(DEFAULT_HEALTH_SERVER_PORT),
        })
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            ("ARENA_SERVER_ID", "w1"),
            ("ARENA_AUTH_TOKEN", "token"),
            ("ARENA_API_URL", "http://arenad:8080/"),
            ("ARENA_START_COMMAND", r#"["./server","--port","$ARENA_PORT_GAME"]"#),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        map
    }

    fn load(map: &HashMap<String, String>) -> ConfigResult<SupervisorConfig> {
        SupervisorConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = load(&env(&[])).unwrap();
        assert_eq!(config.server_id, "w1");
        assert_eq!(config.api_url, "http://arenad:8080");
        assert_eq!(config.command, vec!["./server", "--port", "$ARENA_PORT_GAME"]);
        assert_eq!(config.grace_period, DEFAULT_GRACE_PERIOD);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.health_server_port, DEFAULT_HEALTH_SERVER_PORT);
        assert_eq!(config.health.kind, HealthKind::None);
        assert!(config.workdir.is_none());
    }

    #[test]
    fn missing_required_value() {
        let mut map = env(&[]);
        map.remove("ARENA_AUTH_TOKEN");
        assert!(matches!(load(&map), Err(ConfigError::Missing(key)) if key == "ARENA_AUTH_TOKEN"));
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let map = env(&[("ARENA_SERVER_ID", "  ")]);
        assert!(matches!(load(&map), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn command_must_be_a_json_array() {
        let map = env(&[("ARENA_START_COMMAND", "./server --port 1")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
        let map = env(&[("ARENA_START_COMMAND", "[]")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn port_check_settings() {
        let map = env(&[
            ("ARENA_HEALTH_TYPE", "port"),
            ("ARENA_HEALTH_PORT", "27015"),
            ("ARENA_HEALTH_PROTOCOL", "UDP"),
            ("ARENA_HEALTH_INITIAL_DELAY", "2s"),
            ("ARENA_HEALTH_TIMEOUT", "1m"),
            ("ARENA_HEALTH_INTERVAL", "500ms"),
        ]);
        let config = load(&map).unwrap();
        assert_eq!(config.health.kind, HealthKind::Port);
        assert_eq!(config.health.port, Some(27015));
        assert_eq!(config.health.protocol, Protocol::Udp);
        assert_eq!(config.health.initial_delay, Duration::from_secs(2));
        assert_eq!(config.health.timeout, Duration::from_secs(60));
        assert_eq!(config.health.interval, Duration::from_millis(500));
    }

    #[test]
    fn port_check_requires_port() {
        let map = env(&[("ARENA_HEALTH_TYPE", "port")]);
        assert!(matches!(load(&map), Err(ConfigError::Missing(key)) if key == "ARENA_HEALTH_PORT"));
    }

    #[test]
    fn log_pattern_is_compiled() {
        let map = env(&[
            ("ARENA_HEALTH_TYPE", "log-pattern"),
            ("ARENA_HEALTH_PATTERN", r"Done \(\d+\.\d+s\)!"),
        ]);
        let config = load(&map).unwrap();
        let pattern = config.health.pattern.unwrap();
        assert!(pattern.is_match("[Server] Done (3.21s)! For help, type \"help\""));

        let map = env(&[("ARENA_HEALTH_TYPE", "log-pattern"), ("ARENA_HEALTH_PATTERN", "(")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn malformed_values() {
        let map = env(&[("ARENA_GRACE_PERIOD", "soon")]);
        assert!(matches!(load(&map), Err(ConfigError::InvalidDuration { .. })));
        let map = env(&[("ARENA_HEALTH_SERVER_PORT", "70000")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
        let map = env(&[("ARENA_HEALTH_TYPE", "http")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
        let map = env(&[("ARENA_HEARTBEAT_INTERVAL", "0s")]);
        assert!(matches!(load(&map), Err(ConfigError::Invalid { .. })));
    }
}
