//! System configuration parsing.

use crate::nodes::{first_string_arg, first_u64_arg, u64_prop};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub agents: AgentConfig,
    pub logs: LogConfig,
    /// What happens to a run whose agent fails or goes offline mid-execution.
    pub on_agent_lost: OnAgentLost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Safety-net tick when no wake-up arrives.
    pub tick_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agents silent for longer than this are forced OFFLINE.
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// How long an out-of-order fragment waits for the missing sequence numbers.
    pub gap_window: Duration,
    /// Per-subscriber buffer of live updates.
    pub channel_capacity: usize,
}

/// Policy for runs orphaned by a lost agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum OnAgentLost {
    /// Leave the run FAILED.
    Fail,
    /// Fail the run and enqueue a retry, up to `max_attempts` runs in total.
    Requeue { max_attempts: u32 },
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:8080".to_string(),
            },
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_millis(1000),
            },
            agents: AgentConfig {
                heartbeat_timeout: Duration::from_secs(30),
                sweep_interval: Duration::from_secs(5),
            },
            logs: LogConfig {
                gap_window: Duration::from_millis(2000),
                channel_capacity: 256,
            },
            on_agent_lost: OnAgentLost::Requeue { max_attempts: 3 },
        }
    }
}

/// Parse system configuration from KDL text. Missing settings keep their defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                for child in children(node) {
                    if child.name().value() == "bind" {
                        config.server.bind = first_string_arg(child)
                            .ok_or_else(|| ConfigError::MissingField("server.bind".to_string()))?;
                    }
                }
            }
            "scheduler" => {
                for child in children(node) {
                    if child.name().value() == "tick-interval-ms" {
                        let ms = first_u64_arg(child, "scheduler.tick-interval-ms")?;
                        config.scheduler.tick_interval = positive_millis(ms, "tick-interval-ms")?;
                    }
                }
            }
            "agents" => {
                for child in children(node) {
                    match child.name().value() {
                        "heartbeat-timeout-secs" => {
                            let secs = first_u64_arg(child, "agents.heartbeat-timeout-secs")?;
                            config.agents.heartbeat_timeout =
                                positive_millis(secs.saturating_mul(1000), "heartbeat-timeout-secs")?;
                        }
                        "sweep-interval-secs" => {
                            let secs = first_u64_arg(child, "agents.sweep-interval-secs")?;
                            config.agents.sweep_interval =
                                positive_millis(secs.saturating_mul(1000), "sweep-interval-secs")?;
                        }
                        _ => {}
                    }
                }
            }
            "logs" => {
                for child in children(node) {
                    match child.name().value() {
                        "gap-window-ms" => {
                            let ms = first_u64_arg(child, "logs.gap-window-ms")?;
                            config.logs.gap_window = Duration::from_millis(ms);
                        }
                        "channel-capacity" => {
                            let capacity = first_u64_arg(child, "logs.channel-capacity")?;
                            config.logs.channel_capacity = usize::try_from(capacity)
                                .ok()
                                .filter(|c| *c > 0)
                                .ok_or_else(|| ConfigError::InvalidValue {
                                    field: "channel-capacity".to_string(),
                                    message: "must be between 1 and usize::MAX".to_string(),
                                })?;
                        }
                        _ => {}
                    }
                }
            }
            "on-agent-lost" => {
                config.on_agent_lost = parse_on_agent_lost(node)?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a KDL system configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

fn parse_on_agent_lost(node: &KdlNode) -> ConfigResult<OnAgentLost> {
    let policy = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("on-agent-lost policy".to_string()))?;

    match policy.as_str() {
        "fail" => Ok(OnAgentLost::Fail),
        "requeue" => {
            let max_attempts = u64_prop(node, "max-attempts")?.unwrap_or(3);
            let max_attempts = u32::try_from(max_attempts)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "max-attempts".to_string(),
                    message: "must be at least 1".to_string(),
                })?;
            Ok(OnAgentLost::Requeue { max_attempts })
        }
        other => Err(ConfigError::InvalidValue {
            field: "on-agent-lost".to_string(),
            message: format!("unknown policy: {other}"),
        }),
    }
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn positive_millis(ms: u64, field: &str) -> ConfigResult<Duration> {
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_system_config("").unwrap();
        assert_eq!(config, SystemConfig::default());
        assert_eq!(config.agents.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            server {
                bind "127.0.0.1:9090"
            }
            scheduler {
                tick-interval-ms 250
            }
            agents {
                heartbeat-timeout-secs 10
                sweep-interval-secs 2
            }
            logs {
                gap-window-ms 500
                channel-capacity 64
            }
            on-agent-lost "requeue" max-attempts=5
        "#;

        let config = parse_system_config(kdl).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9090");
        assert_eq!(config.scheduler.tick_interval, Duration::from_millis(250));
        assert_eq!(config.agents.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.agents.sweep_interval, Duration::from_secs(2));
        assert_eq!(config.logs.gap_window, Duration::from_millis(500));
        assert_eq!(config.logs.channel_capacity, 64);
        assert_eq!(
            config.on_agent_lost,
            OnAgentLost::Requeue { max_attempts: 5 }
        );
    }

    #[test]
    fn test_fail_policy() {
        let config = parse_system_config(r#"on-agent-lost "fail""#).unwrap();
        assert_eq!(config.on_agent_lost, OnAgentLost::Fail);
    }

    #[test]
    fn test_rejects_unknown_policy_and_zero_timeout() {
        assert!(matches!(
            parse_system_config(r#"on-agent-lost "ignore""#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_system_config("agents {\n heartbeat-timeout-secs 0\n}"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
