use std::time::Duration;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::credentials::CredentialScope;
use crate::exec::{CommandRunner, CommandSpec};
use crate::gates::RELEASE_BRANCHES;
use crate::metadata::BuildMetadata;

pub const REGISTRY_USER: &str = "REGISTRY_USER";
pub const REGISTRY_TOKEN: &str = "REGISTRY_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Pushed { tags: Vec<String> },
    Skipped { reason: String },
}

/// Tag and push the built image.
///
/// Absent credentials produce `Skipped`, never an error. A failed login is
/// fatal for the stage: pushing against an unauthenticated daemon would
/// only fail later with a less useful message. After a successful login the
/// registry session is always closed, even when a push failed, so
/// credential residency on the executor is minimized.
pub fn publish(
    engine: &str,
    metadata: &BuildMetadata,
    branch: &str,
    scope: &CredentialScope,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<PublishOutcome> {
    let (Some(user), Some(token)) = (scope.get(REGISTRY_USER), scope.get(REGISTRY_TOKEN)) else {
        info!(
            registry = %metadata.registry_host,
            "Registry credentials not configured; skipping publish"
        );
        return Ok(PublishOutcome::Skipped {
            reason: "registry credentials not configured".to_string(),
        });
    };

    let login = runner.run(
        &CommandSpec::new(engine)
            .args([
                "login",
                &metadata.registry_host,
                "-u",
                user.expose(),
                "--password-stdin",
            ])
            .stdin(token.expose().as_bytes().to_vec())
            .sensitive()
            .timeout(timeout),
    )?;
    if !login.status.success() {
        bail!(
            "registry login to '{}' failed ({}): {}",
            metadata.registry_host,
            login.status,
            login.stderr.trim()
        );
    }

    let pushed = push_tags(engine, metadata, branch, runner, timeout);

    let logout = runner.run(
        &CommandSpec::new(engine)
            .args(["logout", &metadata.registry_host])
            .timeout(timeout),
    );
    match logout {
        Ok(outcome) if outcome.status.success() => {}
        Ok(outcome) => warn!(
            registry = %metadata.registry_host,
            status = %outcome.status,
            "Registry logout failed"
        ),
        Err(err) => warn!(
            registry = %metadata.registry_host,
            error = %err,
            "Registry logout could not be attempted"
        ),
    }

    pushed.map(|tags| PublishOutcome::Pushed { tags })
}

fn push_tags(
    engine: &str,
    metadata: &BuildMetadata,
    branch: &str,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<Vec<String>> {
    let primary = metadata.image_ref();
    push_one(engine, &primary, runner, timeout)?;
    let mut tags = vec![primary.clone()];

    // The moving `latest` alias only follows canonical release branches.
    if RELEASE_BRANCHES.contains(&branch) {
        let latest = metadata.latest_ref();
        let retag = runner.run(
            &CommandSpec::new(engine)
                .args(["tag", &primary, &latest])
                .timeout(timeout),
        )?;
        if !retag.status.success() {
            bail!("tagging '{latest}' failed ({})", retag.status);
        }
        push_one(engine, &latest, runner, timeout)?;
        tags.push(latest);
    }

    Ok(tags)
}

fn push_one(
    engine: &str,
    tag: &str,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<()> {
    let outcome = runner.run(&CommandSpec::new(engine).args(["push", tag]).timeout(timeout))?;
    if !outcome.status.success() {
        bail!(
            "pushing '{tag}' failed ({}): {}",
            outcome.status,
            outcome.stderr.trim()
        );
    }
    info!(%tag, "Image pushed");
    Ok(())
}
