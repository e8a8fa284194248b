//! Balancer configuration.
//!
//! Grounded in pgdog-config's `General`/`Database` layering (cluster-wide
//! default, `#[serde(default = "...")]` per-field fallback, per-entity
//! override) -- here specialised to "cluster-wide default, per-server
//! override" for `max_lag`.

use serde::{Deserialize, Serialize};

use crate::{
    domain::DbDomain,
    error::ConfigError,
    round::Stage,
    server_registry::{ServerDescriptor, ServerRegistry},
};

/// One server entry as it appears in configuration. Converted into a
/// [`crate::server_registry::ServerDescriptor`] at load time; index 0 is
/// always the writer regardless of its position in this list's source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default = "ServerConfig::weight")]
    pub weight: f64,
    #[serde(default)]
    pub group_weights: std::collections::BTreeMap<String, f64>,
    pub max_lag: Option<f64>,
    #[serde(default)]
    pub is_static: bool,
}

impl ServerConfig {
    fn weight() -> f64 {
        1.0
    }
}

/// A previously-persisted callback-stage round to resume at startup
/// (`roundStage` config key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundStageConfig {
    pub stage: ResumeStage,
    pub round_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStage {
    CommitCallbacks,
    RollbackCallbacks,
}

impl From<ResumeStage> for Stage {
    fn from(value: ResumeStage) -> Self {
        match value {
            ResumeStage::CommitCallbacks => Stage::CommitCallbacks,
            ResumeStage::RollbackCallbacks => Stage::RollbackCallbacks,
        }
    }
}

/// Top-level balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Ordered list of server descriptors; index 0 is the writer.
    pub servers: Vec<ServerConfig>,
    /// Canonical local DB domain id, e.g. `pgdog-pub`.
    pub local_domain: String,
    /// Default per-server max lag threshold, in seconds.
    #[serde(default = "Config::max_lag")]
    pub max_lag: f64,
    /// Default replication wait timeout, in seconds.
    #[serde(default = "Config::wait_timeout")]
    pub wait_timeout: f64,
    /// Non-`None` forces read-only regardless of the probe.
    #[serde(default)]
    pub read_only_reason: Option<String>,
    /// Fallback query group when none is given or an unknown one is named.
    #[serde(default = "Config::default_group")]
    pub default_group: String,
    /// Resume a previously-persisted callback-stage round.
    #[serde(default)]
    pub round_stage: Option<RoundStageConfig>,
}

impl Config {
    fn max_lag() -> f64 {
        5.0
    }

    fn wait_timeout() -> f64 {
        5.0
    }

    fn default_group() -> String {
        "default".to_string()
    }

    /// Parse from a TOML document, following pgdog-config's file-backed
    /// load path.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::EmptyServers);
        }
        Ok(())
    }

    /// Build a [`ServerRegistry`] from `self.servers`; the first entry
    /// becomes the writer (index 0).
    pub fn build_registry(&self) -> Result<ServerRegistry, ConfigError> {
        self.validate()?;
        let mut iter = self.servers.iter();
        let writer_config = iter.next().expect("validated non-empty above");

        let writer = ServerDescriptor::writer(writer_config.name.clone())
            .with_weight(writer_config.weight)
            .with_group_weights(writer_config.group_weights.clone())
            .with_static(writer_config.is_static);
        let writer = match writer_config.max_lag {
            Some(lag) => writer.with_max_lag(lag),
            None => writer,
        };

        let replicas = iter
            .enumerate()
            .map(|(i, s)| {
                let mut descriptor = ServerDescriptor::replica(i + 1, s.name.clone(), s.weight)
                    .with_group_weights(s.group_weights.clone())
                    .with_static(s.is_static);
                if let Some(lag) = s.max_lag {
                    descriptor = descriptor.with_max_lag(lag);
                }
                descriptor
            })
            .collect();

        Ok(ServerRegistry::new(writer, replicas))
    }

    /// Parse `local_domain` into a [`DbDomain`].
    pub fn local_domain(&self) -> Result<DbDomain, ConfigError> {
        crate::domain::DomainResolver::parse_canonical(&self.local_domain)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_applied_on_missing_fields() {
        let toml = r#"
            local_domain = "pgdog-pub"
            [[servers]]
            name = "writer"
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.max_lag, 5.0);
        assert_eq!(config.wait_timeout, 5.0);
        assert_eq!(config.default_group, "default");
        assert_eq!(config.servers[0].weight, 1.0);
    }

    #[test]
    fn test_empty_servers_rejected() {
        let toml = r#"
            local_domain = "pgdog-pub"
            servers = []
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_per_server_max_lag_override() {
        let toml = r#"
            local_domain = "pgdog-pub"
            max_lag = 5.0
            [[servers]]
            name = "writer"
            [[servers]]
            name = "replica-a"
            max_lag = 0.5
        "#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.servers[1].max_lag, Some(0.5));
    }

    #[test]
    fn test_build_registry_first_entry_is_writer() {
        let toml = r#"
            local_domain = "pgdog-pub"
            [[servers]]
            name = "writer"
            [[servers]]
            name = "replica-a"
            weight = 10.0
            max_lag = 0.1
        "#;
        let config = Config::from_toml(toml).unwrap();
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.writer().name, "writer");
        assert_eq!(registry.get(1).unwrap().name, "replica-a");
        assert_eq!(registry.get(1).unwrap().max_lag, Some(0.1));
    }

    #[test]
    fn test_local_domain_parses_canonical_string() {
        let toml = r#"
            local_domain = "pgdog-pub"
            [[servers]]
            name = "writer"
        "#;
        let config = Config::from_toml(toml).unwrap();
        let domain = config.local_domain().unwrap();
        assert_eq!(domain.database.as_deref(), Some("pgdog"));
        assert_eq!(domain.prefix, "pub");
    }
}
