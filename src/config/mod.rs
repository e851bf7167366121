use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use std::{fs, path::Path};

use crate::core::queue::{DispatchOrder, OverflowPolicy, QueueConfig};
use crate::core::routing::RejectPolicy;

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub order: DispatchOrder,
    pub expiry_sweep_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            order: DispatchOrder::RoundRobin,
            expiry_sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct QueueDefaults {
    pub max_depth: usize,
    pub overflow_policy: OverflowPolicy,
    pub default_ttl_ms: u64,
}

/// A queue the daemon declares at startup. Unset fields fall back to
/// `[queues.defaults]`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    /// Name of the queue rejected and orphaned messages are routed to.
    pub alternate: Option<String>,
    pub max_depth: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub default_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct QueuesConfig {
    pub defaults: QueueDefaults,
    pub declare: Vec<QueueDeclaration>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub rejection: RejectPolicy,
    pub queues: QueuesConfig,
}

impl Config {
    /// Effective settings for a queue, with `declaration` overriding the defaults.
    pub fn queue_config(&self, declaration: Option<&QueueDeclaration>) -> QueueConfig {
        let defaults = &self.queues.defaults;
        QueueConfig {
            max_depth: declaration
                .and_then(|d| d.max_depth)
                .unwrap_or(defaults.max_depth),
            overflow_policy: declaration
                .and_then(|d| d.overflow_policy)
                .unwrap_or(defaults.overflow_policy),
            default_ttl_ms: declaration
                .and_then(|d| d.default_ttl_ms)
                .unwrap_or(defaults.default_ttl_ms),
            dispatch_order: self.dispatch.order,
            reject: self.rejection.clone(),
        }
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch.expiry_sweep_interval_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch.expiry_sweep_interval_ms == 0 {
            bail!("dispatch.expiry_sweep_interval_ms must be greater than zero");
        }
        let mut seen = HashSet::new();
        for declaration in &self.queues.declare {
            if declaration.name.is_empty() {
                bail!("declared queue with empty name");
            }
            if !seen.insert(declaration.name.as_str()) {
                bail!("queue '{}' declared twice", declaration.name);
            }
            if declaration.alternate.as_deref() == Some(declaration.name.as_str()) {
                bail!("queue '{}' cannot be its own alternate", declaration.name);
            }
        }
        Ok(())
    }
}

pub fn parse_config(raw: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw: String = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rejection.max_rejections, 3);
        assert_eq!(config.expiry_sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn declaration_overrides_defaults() {
        let config = parse_config(
            r#"
            [dispatch]
            order = "registration"

            [rejection]
            max_rejections = 5
            drop_unroutable = false

            [queues.defaults]
            max_depth = 100
            default_ttl_ms = 30000

            [[queues.declare]]
            name = "orders"
            alternate = "orders.dlq"
            overflow_policy = "drop_oldest"

            [[queues.declare]]
            name = "orders.dlq"
            max_depth = 0
            "#,
        )
        .unwrap();

        let orders = config.queue_config(config.queues.declare.first());
        assert_eq!(orders.max_depth, 100);
        assert_eq!(orders.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(orders.default_ttl_ms, 30_000);
        assert_eq!(orders.dispatch_order, DispatchOrder::Registration);
        assert_eq!(orders.reject.max_rejections, 5);
        assert!(orders.reject.exclude_rejecting_subscriptions);
        assert!(!orders.reject.drop_unroutable);

        let dlq = config.queue_config(config.queues.declare.get(1));
        assert_eq!(dlq.max_depth, 0);
        assert_eq!(dlq.overflow_policy, OverflowPolicy::DropNew);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let err = parse_config(
            r#"
            [[queues.declare]]
            name = "a"
            [[queues.declare]]
            name = "a"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn unknown_overflow_policy_fails() {
        assert!(parse_config("[queues.defaults]\noverflow_policy = \"spill\"").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config("/definitely/not/here.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here.toml"));
    }
}
