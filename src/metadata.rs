use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::plan::Plan;

/// Sentinel recorded when a run is not backed by a VCS checkout.
pub const LOCAL_BUILD_REF: &str = "local-build";
pub const DEFAULT_REGISTRY: &str = "docker.io";

pub const ENV_BRANCH: &str = "BRANCH_NAME";
pub const ENV_COMMIT: &str = "GIT_COMMIT";
pub const ENV_BUILD_NUMBER: &str = "BUILD_NUMBER";
pub const ENV_REGISTRY: &str = "REGISTRY_HOST";

/// Immutable identifying values for one pipeline run. Computed once at start
/// and shared read-only by every stage.
#[derive(Debug, Clone)]
pub struct BuildMetadata {
    pub image_name: String,
    pub tag: String,
    pub registry_host: String,
    pub build_date: DateTime<Utc>,
    pub vcs_ref: String,
    pub branch: String,
    pub build_number: u64,
}

impl BuildMetadata {
    /// Resolve run metadata from the plan and the ambient CI context.
    ///
    /// Never fails: absent values degrade to documented sentinels (`local`
    /// commit fragment, [`LOCAL_BUILD_REF`], build number 0, `detached`
    /// branch, [`DEFAULT_REGISTRY`]).
    pub fn resolve(
        plan: &Plan,
        branch_override: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Self {
        let commit = env.get(ENV_COMMIT).map(String::as_str).unwrap_or_default();
        let short = if commit.is_empty() {
            "local".to_string()
        } else {
            commit.chars().take(7).collect()
        };
        let build_number = env
            .get(ENV_BUILD_NUMBER)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0);
        let branch = branch_override
            .map(str::to_string)
            .or_else(|| env.get(ENV_BRANCH).cloned())
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| "detached".to_string());
        let registry_host = env
            .get(ENV_REGISTRY)
            .cloned()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| plan.image.registry.clone())
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());

        Self {
            image_name: plan.image.name.clone(),
            tag: format!("{build_number}-{short}"),
            registry_host,
            build_date: Utc::now(),
            vcs_ref: if commit.is_empty() {
                LOCAL_BUILD_REF.to_string()
            } else {
                commit.to_string()
            },
            branch,
            build_number,
        }
    }

    pub fn is_local(&self) -> bool {
        self.vcs_ref == LOCAL_BUILD_REF
    }

    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry_host, self.image_name)
    }

    /// Fully qualified primary image reference, e.g. `docker.io/app:42-deadbee`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.repository(), self.tag)
    }

    pub fn latest_ref(&self) -> String {
        format!("{}:latest", self.repository())
    }
}
