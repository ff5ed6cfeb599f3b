//! YAML configuration.
//!
//! Every section has defaults, so an empty file (or no file) is valid.
//! Secrets never live here; they come from the environment.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorOptions;
use crate::evaluator::EvaluatorOptions;
use crate::solver::SolverOptions;

pub const DEFAULT_CONFIG_PATH: &str = "changeflow.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub substrate: SubstrateConfig,
    pub llm: LlmConfig,
    pub tracker: TrackerConfig,
    pub coordinator: CoordinatorConfig,
    pub solver: SolverConfig,
    pub evaluator: EvaluatorConfig,
    pub gateway: GatewayConfig,
    pub archive: ArchiveConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub backend: Backend,
    pub redis_url: String,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://localhost:6379/0".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".into(),
            max_tokens: 4000,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub base_url: String,
    pub queue: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.tracker.yandex.net/v3".into(),
            queue: "TREK".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub poll_interval_ms: u64,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub marker_ttl_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_attempts: 5,
            marker_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub styles: Vec<String>,
    pub marker_ttl_secs: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            styles: vec!["balanced".into(), "terse".into(), "thorough".into()],
            marker_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Defaults to the number of solver styles.
    pub expected_solvers: Option<usize>,
    pub solution_set_ttl_secs: u64,
    /// 0 re-solves forever.
    pub max_judge_attempts: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            expected_solvers: None,
            solution_set_ttl_secs: 3600,
            max_judge_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub result_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
            result_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub path: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/archive"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load `path`. A missing file at the default location yields defaults;
    /// a missing file that was asked for explicitly is an error.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Self::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides. Takes a lookup so tests need not touch the
    /// process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.is_empty()) {
            self.substrate.redis_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.solver.styles.is_empty() {
            return invalid("solver.styles must name at least one style");
        }
        let mut seen = HashSet::new();
        for style in &self.solver.styles {
            if style.trim().is_empty() {
                return invalid("solver.styles contains an empty style");
            }
            if !seen.insert(style.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "solver.styles lists '{style}' more than once"
                )));
            }
        }
        if self.expected_solvers() == 0 {
            return invalid("evaluator.expected_solvers must be positive");
        }
        let ttls = [
            ("coordinator.marker_ttl_secs", self.coordinator.marker_ttl_secs),
            ("coordinator.poll_interval_ms", self.coordinator.poll_interval_ms),
            ("solver.marker_ttl_secs", self.solver.marker_ttl_secs),
            ("evaluator.solution_set_ttl_secs", self.evaluator.solution_set_ttl_secs),
            ("gateway.result_ttl_secs", self.gateway.result_ttl_secs),
        ];
        for (name, value) in ttls {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn expected_solvers(&self) -> usize {
        self.evaluator
            .expected_solvers
            .unwrap_or(self.solver.styles.len())
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            poll_interval: Duration::from_millis(self.coordinator.poll_interval_ms),
            max_attempts: self.coordinator.max_attempts,
            marker_ttl: Duration::from_secs(self.coordinator.marker_ttl_secs),
            result_ttl: Duration::from_secs(self.gateway.result_ttl_secs),
        }
    }

    pub fn solver_options(&self, style: &str) -> SolverOptions {
        SolverOptions {
            style: style.to_string(),
            marker_ttl: Duration::from_secs(self.solver.marker_ttl_secs),
        }
    }

    pub fn evaluator_options(&self) -> EvaluatorOptions {
        EvaluatorOptions {
            expected_solvers: self.expected_solvers(),
            solution_set_ttl: Duration::from_secs(self.evaluator.solution_set_ttl_secs),
            max_judge_attempts: self.evaluator.max_judge_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_all_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.substrate.backend, Backend::Memory);
        assert_eq!(config.expected_solvers(), 3);
        assert_eq!(config.gateway.bind.port(), 8000);
        config.validate().unwrap();
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
substrate:
  backend: redis
solver:
  styles: [terse, thorough]
evaluator:
  max_judge_attempts: 0
logging:
  format: json
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.substrate.backend, Backend::Redis);
        assert_eq!(config.substrate.redis_url, "redis://localhost:6379/0");
        assert_eq!(config.expected_solvers(), 2);
        assert_eq!(config.evaluator_options().max_judge_attempts, 0);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.coordinator.max_attempts, 5);
    }

    #[test]
    fn options_convert_units() {
        let config = Config::default();
        let c = config.coordinator_options();
        assert_eq!(c.poll_interval, Duration::from_secs(1));
        assert_eq!(c.result_ttl, Duration::from_secs(3600));
        let s = config.solver_options("terse");
        assert_eq!(s.style, "terse");
        assert_eq!(s.marker_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn rejects_bad_solver_setups() {
        let mut config = Config::default();
        config.solver.styles = vec![];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.solver.styles = vec!["terse".into(), "terse".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let mut config = Config::default();
        config.evaluator.expected_solvers = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.solver.marker_ttl_secs = 0;
        assert!(config.validate().unwrap_err().to_string().contains("solver.marker_ttl_secs"));
    }

    #[test]
    fn redis_url_comes_from_environment() {
        let mut config = Config::default();
        config.apply_env(|name| (name == "REDIS_URL").then(|| "redis://cache:6379/2".to_string()));
        assert_eq!(config.substrate.redis_url, "redis://cache:6379/2");

        let mut config = Config::default();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.substrate.redis_url, "redis://localhost:6379/0");
    }

    #[test]
    fn load_handles_missing_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(Config::load(&missing, false).is_ok());
        assert!(matches!(
            Config::load(&missing, true),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("changeflow.yaml");
        std::fs::write(&path, "tracker:\n  queue: DOCS\n").unwrap();
        let config = Config::load(&path, true).unwrap();
        assert_eq!(config.tracker.queue, "DOCS");
    }
}
