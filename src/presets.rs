use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::plan::{CommandSet, ImageSpec, Plan, TestEnv, VerifySpec};

pub const PRESET_NAMES: &[&str] = &["default", "compose"];

/// Write a starter plan file for the named preset and return its path.
pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let plan = match name {
        "default" => default_plan(),
        "compose" => compose_plan(),
        other => bail!(
            "unknown preset '{other}' (available: {})",
            PRESET_NAMES.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&plan)
        .with_context(|| format!("Failed to render preset '{name}'"))?;

    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create plan directory: {}", parent.display())
        })?;
    }
    std::fs::write(destination, rendered)
        .with_context(|| format!("Failed to write plan file: {}", destination.display()))?;

    info!(preset = name, path = %destination.display(), "Plan file generated");
    Ok(destination.to_path_buf())
}

fn default_plan() -> Plan {
    Plan {
        version: 1,
        image: ImageSpec {
            name: "webapp".to_string(),
            registry: None,
            health_path: "/health".to_string(),
            health_port: 8080,
        },
        verify: VerifySpec::default(),
        compose: BTreeMap::new(),
        deadline_minutes: crate::plan::DEFAULT_DEADLINE_MINUTES,
        engine: "docker".to_string(),
        commands: CommandSet {
            install: Some(command(&["npm", "ci"])),
            lint: Some(command(&["npm", "run", "lint"])),
            deploy: None,
        },
        test_env: TestEnv::default(),
    }
}

fn compose_plan() -> Plan {
    let mut plan = default_plan();
    plan.compose = BTreeMap::from([
        (
            "full-stack".to_string(),
            PathBuf::from("compose/full-stack.yaml"),
        ),
        ("minimal".to_string(), PathBuf::from("compose/minimal.yaml")),
    ]);
    plan.commands.deploy = Some(command(&["scripts/deploy.sh"]));
    plan
}

fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_plan;
    use tempfile::tempdir;

    #[test]
    fn default_preset_writes_a_loadable_plan() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("slipway.yaml");

        let written = generate_preset("default", &path).unwrap();
        assert_eq!(written, path);

        let plan = Plan::load(&path).unwrap();
        assert_eq!(plan.version, 1);
        assert_eq!(plan.commands.install.as_deref().unwrap()[0], "npm");
        assert!(plan.compose.is_empty());
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn compose_preset_includes_named_topologies() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/dir/slipway.yaml");

        generate_preset("compose", &path).unwrap();

        let plan = Plan::load(&path).unwrap();
        assert!(plan.compose_path("full-stack").is_some());
        assert!(plan.compose_path("minimal").is_some());
        assert!(plan.commands.deploy.is_some());
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn unknown_preset_is_an_error() {
        let temp = tempdir().unwrap();
        let err = generate_preset("bogus", &temp.path().join("plan.yaml")).unwrap_err();
        assert!(err.to_string().contains("unknown preset 'bogus'"));
    }
}
