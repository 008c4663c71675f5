use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::exec::{CommandSpec, ExecError, ExecOutcome};
use crate::gates::{DEPLOY_BRANCHES, Gate, PUSH_BRANCHES, RunFlag};
use crate::health::{self, HealthOutcome, HttpProbe, RetryBudget, ThreadSleeper};
use crate::metadata::BuildMetadata;
use crate::pipeline::{StageContext, StageDefinition, StageDisposition};
use crate::publish::{self, PublishOutcome, REGISTRY_TOKEN, REGISTRY_USER};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(60);
const LOG_TAIL_LINES: &str = "50";

/// The fixed, ordered stage list of a release run. Gates decide per run
/// which of these actually execute; the order never changes.
pub fn release_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new("checkout", Gate::Always, checkout),
        StageDefinition::new("install", Gate::Always, install),
        StageDefinition::new("lint", Gate::Always, lint),
        StageDefinition::new("build", Gate::Always, build),
        StageDefinition::new("verify-container", Gate::Always, verify_container)
            .with_post(remove_verify_container),
        StageDefinition::new("verify-compose", Gate::ComposeSelected, verify_compose)
            .with_post(teardown_compose),
        StageDefinition::new(
            "publish",
            Gate::BranchInOrFlag {
                branches: PUSH_BRANCHES,
                flag: RunFlag::PushImage,
            },
            publish_stage,
        ),
        StageDefinition::new(
            "deploy",
            Gate::BranchInOrFlag {
                branches: DEPLOY_BRANCHES,
                flag: RunFlag::Deploy,
            },
            deploy,
        ),
    ]
}

fn checkout(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let line = format!(
        "branch {} at {} (build {})",
        ctx.run.branch, ctx.metadata.vcs_ref, ctx.metadata.build_number
    );
    ctx.say(line);
    let tag_line = format!("image tag {}", ctx.metadata.tag);
    ctx.say(tag_line);
    if ctx.metadata.is_local() {
        return Ok(StageDisposition::Warned(
            "no VCS ref in the environment; recording a local build".to_string(),
        ));
    }
    Ok(StageDisposition::Done)
}

fn install(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let Some(command) = ctx.plan.commands.install.clone() else {
        return Ok(StageDisposition::Warned(
            "no install step defined".to_string(),
        ));
    };
    run_command_line(ctx, &command)?;
    Ok(StageDisposition::Done)
}

/// Lint tooling is optional and often absent on fresh executors; a missing
/// tool or a failing lint run is downgraded to a warning instead of sinking
/// the release.
fn lint(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let Some(command) = ctx.plan.commands.lint.clone() else {
        return Ok(StageDisposition::Warned("no lint step defined".to_string()));
    };
    let (program, args) = split_command(&command)?;
    let outcome = match ctx.run_command(CommandSpec::new(program).args(args.iter().cloned())) {
        Ok(outcome) => outcome,
        Err(err) if is_spawn_failure(&err) => {
            return Ok(StageDisposition::Warned(format!(
                "lint tool unavailable: {err}"
            )));
        }
        Err(err) => return Err(err),
    };
    if !outcome.status.success() {
        return Ok(StageDisposition::Warned(format!(
            "lint reported issues ({})",
            outcome.status
        )));
    }
    Ok(StageDisposition::Done)
}

fn build(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let engine = ctx.plan.engine.clone();
    let image_ref = ctx.metadata.image_ref();
    ctx.run_checked(CommandSpec::new(&engine).args(["build", "-t", &image_ref, "."]))?;

    // Layers accumulate on shared executors; prune at run end, best effort.
    let runner = ctx.runner.clone();
    ctx.cleanup.register("prune unused image layers", move || {
        let outcome = runner.run(
            &CommandSpec::new(&engine)
                .args(["image", "prune", "-f"])
                .timeout(TEARDOWN_TIMEOUT),
        )?;
        if !outcome.status.success() {
            bail!("image prune finished with {}", outcome.status);
        }
        Ok(())
    });

    Ok(StageDisposition::Done)
}

fn verify_container(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let engine = ctx.plan.engine.clone();
    let name = verify_container_name(ctx.metadata);
    let port = ctx.plan.image.health_port;
    let image_ref = ctx.metadata.image_ref();

    let mut spec = CommandSpec::new(&engine).args([
        "run",
        "-d",
        "--name",
        &name,
        "-p",
        &format!("{port}:{port}"),
    ]);
    for (key, value) in ctx.plan.test_env.as_pairs() {
        spec = spec.arg("-e").arg(format!("{key}={value}"));
    }
    ctx.run_checked(spec.arg(&image_ref))?;

    let budget = ctx.plan.verify.container;
    let diagnostics = CommandSpec::new(&engine)
        .args(["logs", "--tail", LOG_TAIL_LINES, &name])
        .timeout(TEARDOWN_TIMEOUT);
    await_service(ctx, budget, diagnostics)
}

fn remove_verify_container(ctx: &mut StageContext<'_>) -> Result<()> {
    let engine = ctx.plan.engine.clone();
    let name = verify_container_name(ctx.metadata);
    let outcome = ctx.run_command(
        CommandSpec::new(engine)
            .args(["rm", "-f", &name])
            .timeout(TEARDOWN_TIMEOUT),
    )?;
    if !outcome.status.success() {
        bail!("removing container '{name}' finished with {}", outcome.status);
    }
    Ok(())
}

fn verify_compose(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let topology = selected_topology(ctx)
        .context("compose verification ran without a topology selection")?;
    let Some(file) = ctx.plan.compose_path(&topology).cloned() else {
        bail!("unknown compose topology '{topology}'");
    };
    let file = file.to_string_lossy().into_owned();

    // Test-only runtime configuration lives in a generated env file that
    // exists for this stage's scope only; teardown removes it.
    let env_file = compose_env_path(ctx.metadata);
    std::fs::write(&env_file, ctx.plan.test_env.render()).with_context(|| {
        format!("Failed to write test env file: {}", env_file.display())
    })?;

    let engine = ctx.plan.engine.clone();
    ctx.run_checked(CommandSpec::new(&engine).args([
        "compose",
        "-f",
        &file,
        "--env-file",
        &env_file.to_string_lossy(),
        "up",
        "-d",
    ]))?;

    let budget = ctx.plan.verify.compose;
    let diagnostics = CommandSpec::new(&engine)
        .args(["compose", "-f", &file, "logs", "--tail", LOG_TAIL_LINES])
        .timeout(TEARDOWN_TIMEOUT);
    await_service(ctx, budget, diagnostics)
}

fn teardown_compose(ctx: &mut StageContext<'_>) -> Result<()> {
    let Some(topology) = selected_topology(ctx) else {
        return Ok(());
    };
    let mut first_error = None;

    if let Some(file) = ctx.plan.compose_path(&topology).cloned() {
        let engine = ctx.plan.engine.clone();
        let file = file.to_string_lossy().into_owned();
        let env_file = compose_env_path(ctx.metadata).to_string_lossy().into_owned();
        match ctx.run_command(
            CommandSpec::new(engine)
                .args(["compose", "-f", &file, "--env-file", &env_file, "down", "-v"])
                .timeout(TEARDOWN_TIMEOUT),
        ) {
            Ok(outcome) if outcome.status.success() => {}
            Ok(outcome) => {
                first_error = Some(anyhow::anyhow!(
                    "compose down finished with {}",
                    outcome.status
                ));
            }
            Err(err) => first_error = Some(err),
        }
    }

    let env_file = compose_env_path(ctx.metadata);
    if let Err(err) = std::fs::remove_file(&env_file)
        && err.kind() != std::io::ErrorKind::NotFound
        && first_error.is_none()
    {
        first_error = Some(
            anyhow::Error::from(err)
                .context(format!("Failed to remove test env file: {}", env_file.display())),
        );
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn publish_stage(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let engine = ctx.plan.engine.clone();
    let metadata = ctx.metadata.clone();
    let branch = ctx.run.branch.clone();
    let runner = ctx.runner.clone();
    let timeout = ctx.remaining();
    let credentials = ctx.credentials;

    let outcome = credentials.scoped(&[REGISTRY_USER, REGISTRY_TOKEN], |scope| {
        publish::publish(&engine, &metadata, &branch, scope, runner.as_ref(), timeout)
    })?;

    match outcome {
        PublishOutcome::Pushed { tags } => {
            for tag in tags {
                let line = format!("pushed {tag}");
                ctx.say(line);
            }
            Ok(StageDisposition::Done)
        }
        PublishOutcome::Skipped { reason } => Ok(StageDisposition::Warned(format!(
            "publish skipped: {reason}"
        ))),
    }
}

fn deploy(ctx: &mut StageContext<'_>) -> Result<StageDisposition> {
    let Some(command) = ctx.plan.commands.deploy.clone() else {
        return Ok(StageDisposition::Warned(
            "no deploy command configured".to_string(),
        ));
    };
    let (program, args) = split_command(&command)?;
    let image_ref = ctx.metadata.image_ref();
    let tag = ctx.metadata.tag.clone();
    ctx.run_checked(
        CommandSpec::new(program)
            .args(args.iter().cloned())
            .env("IMAGE_REF", image_ref)
            .env("IMAGE_TAG", tag),
    )?;
    Ok(StageDisposition::Done)
}

fn await_service(
    ctx: &mut StageContext<'_>,
    budget: RetryBudget,
    diagnostics: CommandSpec,
) -> Result<StageDisposition> {
    let url = ctx.plan.health_url();
    let mut probe = HttpProbe::new(&url)?;
    let mut sleeper = ThreadSleeper;
    match health::await_healthy(&mut probe, &budget, &mut sleeper) {
        HealthOutcome::Ready { attempts } => {
            let line = format!("service ready after {attempts} attempt(s)");
            ctx.say(line);
            Ok(StageDisposition::Done)
        }
        HealthOutcome::Failed {
            attempts,
            last_error,
        } => {
            // Surface the service's recent log tail for operator triage
            // before failing the stage.
            if let Err(err) = ctx.run_command(diagnostics) {
                ctx.say(format!("could not capture service logs: {err}"));
            }
            bail!("health check against {url} exhausted {attempts} attempt(s): {last_error}")
        }
    }
}

fn run_command_line(ctx: &mut StageContext<'_>, command: &[String]) -> Result<ExecOutcome> {
    let (program, args) = split_command(command)?;
    ctx.run_checked(CommandSpec::new(program).args(args.iter().cloned()))
}

fn is_spawn_failure(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ExecError>(), Some(ExecError::Spawn { .. }))
}

fn split_command(command: &[String]) -> Result<(&String, &[String])> {
    command
        .split_first()
        .context("command line cannot be empty")
}

fn selected_topology(ctx: &StageContext<'_>) -> Option<String> {
    ctx.run
        .params
        .compose_file
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn verify_container_name(metadata: &BuildMetadata) -> String {
    format!("{}-verify-{}", metadata.image_name, metadata.tag)
}

fn compose_env_path(metadata: &BuildMetadata) -> PathBuf {
    std::env::temp_dir().join(format!(
        "{}-{}-test.env",
        metadata.image_name, metadata.tag
    ))
}
