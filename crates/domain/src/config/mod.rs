mod autonomy;
mod compaction;
mod gateway;
mod memory;
mod runtime;

pub use autonomy::*;
pub use compaction::*;
pub use gateway::*;
pub use memory::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub autonomy: AutonomyConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub cron: CronConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub email: EmailGatewayConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the loaded configuration. Errors prevent startup;
    /// warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.memory.memory_md_max_chars == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "memory.memory_md_max_chars".into(),
                message: "must be greater than zero".into(),
            });
        }

        if self.gateway.email.enabled {
            if self.gateway.email.email_address.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "gateway.email.email_address".into(),
                    message: "required when the email gateway is enabled".into(),
                });
            }
            if self.gateway.email.poll_interval_seconds == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "gateway.email.poll_interval_seconds".into(),
                    message: "must be greater than zero".into(),
                });
            }
        }

        if self.compaction.keep_last_user_turns == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "compaction.keep_last_user_turns".into(),
                message: "must keep at least one user turn".into(),
            });
        }

        if self.runtime.max_steps == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "runtime.max_steps".into(),
                message: "zero disables all model steps; the assistant will never reply".into(),
            });
        }

        issues
    }

    /// True when no error-severity issue is present.
    pub fn is_valid(&self) -> bool {
        !self
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.is_valid(), "{:?}", config.validate());
    }

    #[test]
    fn enabled_gateway_without_address_is_invalid() {
        let mut config = Config::default();
        config.gateway.email.enabled = true;
        assert!(!config.is_valid());
    }

    #[test]
    fn full_config_parses_from_json() {
        let json = serde_json::json!({
            "memory": {
                "workspace_dir": "/tmp/hm",
                "memory_md_max_chars": 2000,
                "redaction": { "enabled": true, "patterns": ["hunter2"] }
            },
            "autonomy": {
                "heartbeat": { "enabled": true, "every": "15m" },
                "cron": { "enabled": true, "default_timezone": "Asia/Shanghai" }
            },
            "gateway": {
                "email": {
                    "enabled": true,
                    "email_address": "bot@example.com",
                    "imap": { "server": "imap.example.com" },
                    "smtp": { "server": "smtp.example.com" },
                    "poll_interval_seconds": 20
                }
            }
        });
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.memory.memory_md_max_chars, 2000);
        assert_eq!(config.autonomy.heartbeat.every, "15m");
        assert_eq!(config.autonomy.cron.default_timezone, "Asia/Shanghai");
        assert_eq!(config.gateway.email.poll_interval_seconds, 20);
        assert!(config.is_valid());
    }
}
