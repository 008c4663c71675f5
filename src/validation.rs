use serde::Serialize;

use crate::health::RetryBudget;
use crate::plan::Plan;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_plan(plan: &Plan) -> ValidationReport {
    let mut report = ValidationReport::default();

    if plan.version != 1 {
        report
            .errors
            .push(format!("Unsupported plan version: {}", plan.version));
    }

    if plan.image.name.trim().is_empty() {
        report.errors.push("Image name cannot be empty".into());
    }

    if !plan.image.health_path.starts_with('/') {
        report.errors.push(format!(
            "Health path '{}' must be absolute (start with '/')",
            plan.image.health_path
        ));
    }

    if plan.engine.trim().is_empty() {
        report
            .errors
            .push("Container engine binary cannot be empty".into());
    }

    if plan.deadline_minutes == 0 {
        report
            .errors
            .push("Run deadline must be at least one minute".into());
    }

    for (name, path) in &plan.compose {
        if name.trim().is_empty() {
            report
                .errors
                .push("Compose topology names cannot be empty".into());
        }
        if path.as_os_str().is_empty() {
            report
                .errors
                .push(format!("Compose topology '{name}' has an empty file path"));
        }
    }

    report.merge(validate_budget("container", &plan.verify.container, plan));
    report.merge(validate_budget("compose", &plan.verify.compose, plan));

    for (stage, command) in [
        ("install", &plan.commands.install),
        ("lint", &plan.commands.lint),
        ("deploy", &plan.commands.deploy),
    ] {
        if let Some(command) = command
            && command.is_empty()
        {
            report
                .errors
                .push(format!("Command for '{stage}' is declared but empty"));
        }
    }

    if plan.test_env.shared_secret.trim().is_empty() {
        report
            .warnings
            .push("Test env shared secret is empty; the artifact may refuse to boot".into());
    }

    report
}

fn validate_budget(label: &str, budget: &RetryBudget, plan: &Plan) -> ValidationReport {
    let mut report = ValidationReport::default();

    if budget.max_attempts == 0 {
        report.errors.push(format!(
            "Verify budget '{label}' must allow at least one attempt"
        ));
    }

    // The verifier's worst case must leave room for the rest of the run.
    if budget.worst_case() >= plan.deadline() {
        report.errors.push(format!(
            "Verify budget '{label}' ({}s worst case) does not fit under the {}-minute run deadline",
            budget.worst_case().as_secs(),
            plan.deadline_minutes
        ));
    }

    report
}
