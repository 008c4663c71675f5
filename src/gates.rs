use std::fmt;

/// Branches that enable the publish gate without an explicit flag.
pub const PUSH_BRANCHES: &[&str] = &["main", "master", "develop"];
/// Branches that enable the deploy gate without an explicit flag.
pub const DEPLOY_BRANCHES: &[&str] = &["main", "master"];
/// Canonical release branches; publishing from these also moves `latest`.
pub const RELEASE_BRANCHES: &[&str] = &["main", "master"];

/// Caller-supplied run parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    pub push_image: bool,
    pub deploy: bool,
    pub compose_file: Option<String>,
}

impl RunParams {
    pub fn compose_selected(&self) -> bool {
        self.compose_file
            .as_deref()
            .is_some_and(|name| !name.trim().is_empty())
    }
}

/// Everything a gate is allowed to look at. Evaluation is pure: the same
/// context always yields the same decision.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub branch: String,
    pub params: RunParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlag {
    PushImage,
    Deploy,
}

impl RunFlag {
    fn is_set(&self, params: &RunParams) -> bool {
        match self {
            RunFlag::PushImage => params.push_image,
            RunFlag::Deploy => params.deploy,
        }
    }
}

impl fmt::Display for RunFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFlag::PushImage => f.write_str("--push-image"),
            RunFlag::Deploy => f.write_str("--deploy"),
        }
    }
}

/// Declarative predicate deciding whether a stage executes this run.
#[derive(Debug, Clone)]
pub enum Gate {
    Always,
    ComposeSelected,
    BranchInOrFlag {
        branches: &'static [&'static str],
        flag: RunFlag,
    },
}

impl Gate {
    pub fn should_run(&self, ctx: &RunContext) -> bool {
        match self {
            Gate::Always => true,
            Gate::ComposeSelected => ctx.params.compose_selected(),
            Gate::BranchInOrFlag { branches, flag } => {
                branches.contains(&ctx.branch.as_str()) || flag.is_set(&ctx.params)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Gate::Always => "always".to_string(),
            Gate::ComposeSelected => "when --compose-file selects a topology".to_string(),
            Gate::BranchInOrFlag { branches, flag } => {
                format!("branch in {{{}}} or {flag}", branches.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(branch: &str, params: RunParams) -> RunContext {
        RunContext {
            branch: branch.to_string(),
            params,
        }
    }

    fn push_gate() -> Gate {
        Gate::BranchInOrFlag {
            branches: PUSH_BRANCHES,
            flag: RunFlag::PushImage,
        }
    }

    #[test]
    fn always_gate_is_unconditional() {
        assert!(Gate::Always.should_run(&ctx("feature/x", RunParams::default())));
    }

    #[test]
    fn compose_gate_requires_non_empty_selection() {
        let gate = Gate::ComposeSelected;
        assert!(!gate.should_run(&ctx("main", RunParams::default())));
        assert!(!gate.should_run(&ctx(
            "main",
            RunParams {
                compose_file: Some("  ".into()),
                ..Default::default()
            }
        )));
        assert!(gate.should_run(&ctx(
            "main",
            RunParams {
                compose_file: Some("full-stack".into()),
                ..Default::default()
            }
        )));
    }

    #[test]
    fn push_gate_passes_on_release_branches_without_flag() {
        for branch in ["main", "master", "develop"] {
            assert!(push_gate().should_run(&ctx(branch, RunParams::default())));
        }
    }

    #[test]
    fn push_gate_fails_on_feature_branch_without_flag() {
        assert!(!push_gate().should_run(&ctx("feature/x", RunParams::default())));
    }

    #[test]
    fn flag_overrides_branch_mismatch() {
        let params = RunParams {
            push_image: true,
            ..Default::default()
        };
        assert!(push_gate().should_run(&ctx("feature/x", params)));

        let gate = Gate::BranchInOrFlag {
            branches: DEPLOY_BRANCHES,
            flag: RunFlag::Deploy,
        };
        assert!(!gate.should_run(&ctx("develop", RunParams::default())));
        assert!(gate.should_run(&ctx(
            "develop",
            RunParams {
                deploy: true,
                ..Default::default()
            }
        )));
    }

    #[test]
    fn evaluation_is_pure_under_repetition() {
        let context = ctx("main", RunParams::default());
        let first = push_gate().should_run(&context);
        for _ in 0..100 {
            assert_eq!(push_gate().should_run(&context), first);
        }
    }
}
