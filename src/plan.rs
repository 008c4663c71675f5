use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::health::RetryBudget;

pub const DEFAULT_DEADLINE_MINUTES: u64 = 30;

/// Declarative description of one release pipeline: what to build, how to
/// verify it, and which multi-service topologies exist. The ordered stage
/// list itself is fixed in code; the plan only parameterizes it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    pub version: u32,
    pub image: ImageSpec,
    #[serde(default)]
    pub verify: VerifySpec,
    /// Named compose topology files selectable via `--compose-file`.
    #[serde(default)]
    pub compose: BTreeMap<String, PathBuf>,
    #[serde(default = "default_deadline_minutes")]
    pub deadline_minutes: u64,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub commands: CommandSet,
    #[serde(default)]
    pub test_env: TestEnv,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageSpec {
    pub name: String,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifySpec {
    #[serde(default = "RetryBudget::container_default")]
    pub container: RetryBudget,
    #[serde(default = "RetryBudget::compose_default")]
    pub compose: RetryBudget,
}

impl Default for VerifySpec {
    fn default() -> Self {
        Self {
            container: RetryBudget::container_default(),
            compose: RetryBudget::compose_default(),
        }
    }
}

/// Optional per-project command lines for stages whose tooling varies.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandSet {
    #[serde(default)]
    pub install: Option<Vec<String>>,
    #[serde(default)]
    pub lint: Option<Vec<String>>,
    #[serde(default)]
    pub deploy: Option<Vec<String>>,
}

/// Ephemeral, test-only runtime configuration handed to the artifact under
/// verification. Never production values.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestEnv {
    #[serde(default = "default_shared_secret")]
    pub shared_secret: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default = "default_disable_flags")]
    pub disable_flags: Vec<String>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self {
            shared_secret: default_shared_secret(),
            storage: default_storage(),
            storage_path: default_storage_path(),
            disable_flags: default_disable_flags(),
        }
    }
}

impl TestEnv {
    pub fn as_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("APP_SHARED_SECRET".to_string(), self.shared_secret.clone()),
            ("APP_STORAGE".to_string(), self.storage.clone()),
            ("APP_STORAGE_PATH".to_string(), self.storage_path.clone()),
        ];
        for flag in &self.disable_flags {
            let key = format!("APP_DISABLE_{}", flag.to_uppercase().replace('-', "_"));
            pairs.push((key, "true".to_string()));
        }
        pairs
    }

    /// Env-file rendering for `compose --env-file`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.as_pairs() {
            out.push_str(&key);
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse plan YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let plan: Plan = serde_yaml::from_str(content)?;
        Ok(plan)
    }

    pub fn deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.deadline_minutes * 60)
    }

    pub fn health_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}{}",
            self.image.health_port, self.image.health_path
        )
    }

    pub fn compose_path(&self, topology: &str) -> Option<&PathBuf> {
        self.compose.get(topology)
    }
}

fn default_deadline_minutes() -> u64 {
    DEFAULT_DEADLINE_MINUTES
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_shared_secret() -> String {
    "slipway-test-secret".to_string()
}

fn default_storage() -> String {
    "embedded".to_string()
}

fn default_storage_path() -> String {
    "/tmp/slipway-data".to_string()
}

fn default_disable_flags() -> Vec<String> {
    vec!["telemetry".to_string(), "registration".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_plan_fills_defaults() {
        let plan = Plan::from_yaml("version: 1\nimage:\n  name: webapp\n").unwrap();
        assert_eq!(plan.version, 1);
        assert_eq!(plan.image.name, "webapp");
        assert_eq!(plan.image.health_path, "/health");
        assert_eq!(plan.image.health_port, 8080);
        assert_eq!(plan.engine, "docker");
        assert_eq!(plan.deadline_minutes, DEFAULT_DEADLINE_MINUTES);
        assert_eq!(plan.verify.container, RetryBudget::container_default());
        assert_eq!(plan.verify.compose, RetryBudget::compose_default());
        assert!(plan.compose.is_empty());
        assert!(plan.commands.lint.is_none());
    }

    #[test]
    fn full_plan_round_trips_named_topologies() {
        let plan = Plan::from_yaml(
            "version: 1\n\
             image:\n  name: webapp\n  registry: registry.example.com\n  health_port: 9000\n\
             verify:\n  container: {settle_secs: 1, max_attempts: 3, interval_secs: 1}\n\
             compose:\n  full-stack: compose/full-stack.yaml\n  minimal: compose/minimal.yaml\n\
             commands:\n  lint: [npm, run, lint]\n",
        )
        .unwrap();
        assert_eq!(
            plan.compose_path("full-stack"),
            Some(&PathBuf::from("compose/full-stack.yaml"))
        );
        assert!(plan.compose_path("missing").is_none());
        assert_eq!(plan.health_url(), "http://127.0.0.1:9000/health");
        assert_eq!(plan.verify.container.max_attempts, 3);
        assert_eq!(
            plan.commands.lint.as_deref(),
            Some(&["npm".to_string(), "run".to_string(), "lint".to_string()][..])
        );
    }

    #[test]
    fn test_env_renders_disable_flags() {
        let env = TestEnv::default();
        let rendered = env.render();
        assert!(rendered.contains("APP_SHARED_SECRET=slipway-test-secret"));
        assert!(rendered.contains("APP_STORAGE=embedded"));
        assert!(rendered.contains("APP_STORAGE_PATH=/tmp/slipway-data"));
        assert!(rendered.contains("APP_DISABLE_TELEMETRY=true"));
        assert!(rendered.contains("APP_DISABLE_REGISTRATION=true"));
    }
}
