use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use slipway::credentials::CredentialStore;
use slipway::exec::ProcessRunner;
use slipway::gates::{RunContext, RunParams};
use slipway::metadata::BuildMetadata;
use slipway::pipeline::{RunOutcome, Scheduler};
use slipway::plan::Plan;
use slipway::presets::generate_preset;
use slipway::stages::release_stages;
use slipway::validation::validate_plan;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            plan,
            push_image,
            deploy,
            compose_file,
            branch,
            artifact_dir,
            dry_run,
        } => run_pipeline(
            plan,
            RunParams {
                push_image,
                deploy,
                compose_file,
            },
            branch,
            artifact_dir,
            dry_run,
        ),
        Commands::Validate { plan } => validate_plan_cmd(plan),
        Commands::Stages => {
            list_stages();
            Ok(())
        }
        Commands::Plan { action } => plan_command(action),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            clap_complete::generate(shell, &mut command, name, &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn run_pipeline(
    plan_path: PathBuf,
    params: RunParams,
    branch: Option<String>,
    artifact_dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let plan = Plan::load(&plan_path)?;

    let report = validate_plan(&plan);
    for warning in &report.warnings {
        warn!(file = %plan_path.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %plan_path.display(), "{error_msg}");
        }
        bail!(
            "Plan validation failed with {} error(s)",
            report.errors.len()
        );
    }

    if let Some(topology) = &params.compose_file
        && plan.compose_path(topology).is_none()
    {
        let known: Vec<&str> = plan.compose.keys().map(String::as_str).collect();
        bail!(
            "Unknown compose topology '{topology}' (available: {})",
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        );
    }

    let ambient: HashMap<String, String> = std::env::vars().collect();
    let metadata = BuildMetadata::resolve(&plan, branch.as_deref(), &ambient);
    let ctx = RunContext {
        branch: metadata.branch.clone(),
        params,
    };
    let stages = release_stages();

    if dry_run {
        info!(
            image = %metadata.image_ref(),
            branch = %ctx.branch,
            "Dry run; showing gate decisions only"
        );
        for stage in &stages {
            let decision = if stage.gate.should_run(&ctx) {
                "run"
            } else {
                "skip"
            };
            println!("{decision:<5} {} ({})", stage.name, stage.gate.describe());
        }
        return Ok(());
    }

    let mut scheduler = Scheduler::new(plan.deadline());
    if let Some(dir) = artifact_dir {
        scheduler = scheduler.with_artifact_dir(dir);
    }

    let run = scheduler.execute(
        &stages,
        &plan,
        metadata,
        &ctx,
        Arc::new(ProcessRunner),
        &CredentialStore::from_env(),
    );

    match run.outcome() {
        Some(RunOutcome::Succeeded) => Ok(()),
        Some(RunOutcome::Failed { stage, reason }) => {
            bail!("Pipeline failed at stage '{stage}': {reason}")
        }
        None => bail!("Pipeline finished without a recorded outcome"),
    }
}

fn validate_plan_cmd(plan_path: PathBuf) -> Result<()> {
    let plan = Plan::load(&plan_path)?;
    let report = validate_plan(&plan);

    for warning in &report.warnings {
        warn!(file = %plan_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %plan_path.display(), "Plan validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %plan_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Plan validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn list_stages() {
    println!("Release stages, in order:");
    for stage in release_stages() {
        println!("- {} (gate: {})", stage.name, stage.gate.describe());
    }
}

fn plan_command(command: PlanCommands) -> Result<()> {
    match command {
        PlanCommands::New { preset, output } => {
            let destination = output.unwrap_or_else(|| PathBuf::from("slipway.yaml"));
            let generated = generate_preset(&preset, &destination)
                .with_context(|| format!("Failed to generate preset '{preset}'"))?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Plan file generated"
            );
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "slipway",
    version,
    about = "Release pipeline for containerized web services"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the release pipeline described by a plan file.
    Run {
        #[arg(long, default_value = "slipway.yaml")]
        plan: PathBuf,
        /// Publish the image even when the branch gate would skip it.
        #[arg(long)]
        push_image: bool,
        /// Deploy even when the branch gate would skip it.
        #[arg(long)]
        deploy: bool,
        /// Verify against the named compose topology from the plan.
        #[arg(long = "compose-file")]
        compose_file: Option<String>,
        /// Override branch detection from the environment.
        #[arg(long)]
        branch: Option<String>,
        /// Archive per-stage logs and a run summary into this directory.
        #[arg(long = "artifact-dir")]
        artifact_dir: Option<PathBuf>,
        /// Show which stages would run and why, without executing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check a plan file without running it.
    Validate {
        #[arg(long, default_value = "slipway.yaml")]
        plan: PathBuf,
    },
    /// List the fixed stage order and each stage's gate.
    Stages,
    /// Plan file management.
    Plan {
        #[command(subcommand)]
        action: PlanCommands,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Write a starter plan file from a named preset.
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
