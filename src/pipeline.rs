use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cleanup::CleanupStack;
use crate::credentials::CredentialStore;
use crate::exec::{CommandRunner, CommandSpec, ExecOutcome};
use crate::gates::{Gate, RunContext};
use crate::metadata::BuildMetadata;
use crate::notify;
use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Passed,
    PassedWithWarning,
    Skipped,
    Failed,
}

/// Outcome of one stage execution. Appended to the run log, never mutated
/// afterwards.
#[derive(Debug)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub finished_at: DateTime<Utc>,
}

impl StageResult {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Skipped,
            exit_code: None,
            output: String::new(),
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum RunOutcome {
    Succeeded,
    Failed { stage: String, reason: String },
}

/// Top-level aggregate for one pipeline execution. Owns the append-only
/// stage log; the terminal outcome is set exactly once.
#[derive(Debug)]
pub struct PipelineRun {
    pub run_id: String,
    pub metadata: BuildMetadata,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    stage_log: Vec<StageResult>,
    outcome: Option<RunOutcome>,
}

impl PipelineRun {
    pub fn new(metadata: BuildMetadata, branch: String) -> Self {
        let run_id = format!("{}-{}", metadata.image_name, metadata.tag);
        Self {
            run_id,
            metadata,
            branch,
            started_at: Utc::now(),
            stage_log: Vec::new(),
            outcome: None,
        }
    }

    pub fn record(&mut self, result: StageResult) {
        self.stage_log.push(result);
    }

    pub fn stage_log(&self) -> &[StageResult] {
        &self.stage_log
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, Some(RunOutcome::Succeeded))
    }

    fn set_outcome(&mut self, outcome: RunOutcome) {
        if self.outcome.is_some() {
            warn!(run_id = %self.run_id, "Terminal outcome already recorded; keeping the first");
            return;
        }
        self.outcome = Some(outcome);
    }
}

pub enum StageDisposition {
    Done,
    /// Recoverable condition: the stage passes with a warning and the run
    /// continues.
    Warned(String),
}

pub type StageBody =
    Box<dyn for<'a> Fn(&mut StageContext<'a>) -> Result<StageDisposition> + Send + Sync>;
pub type PostAction = Box<dyn for<'a> Fn(&mut StageContext<'a>) -> Result<()> + Send + Sync>;

/// One named, ordered unit of pipeline work: a gate, a body, and an
/// optional teardown that runs after the body on every outcome.
pub struct StageDefinition {
    pub name: &'static str,
    pub gate: Gate,
    pub body: StageBody,
    pub post: Option<PostAction>,
}

impl StageDefinition {
    pub fn new(
        name: &'static str,
        gate: Gate,
        body: impl for<'a> Fn(&mut StageContext<'a>) -> Result<StageDisposition>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name,
            gate,
            body: Box::new(body),
            post: None,
        }
    }

    pub fn with_post(
        mut self,
        post: impl for<'a> Fn(&mut StageContext<'a>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.post = Some(Box::new(post));
        self
    }
}

/// Execution surface handed to a stage body: read-only run facts plus the
/// command runner, credential store, and pipeline-scoped cleanup stack.
pub struct StageContext<'a> {
    pub plan: &'a Plan,
    pub metadata: &'a BuildMetadata,
    pub run: &'a RunContext,
    pub runner: Arc<dyn CommandRunner>,
    pub credentials: &'a CredentialStore,
    pub cleanup: &'a mut CleanupStack,
    deadline: Instant,
    output: String,
    last_exit: Option<i32>,
}

impl StageContext<'_> {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Append a line to the stage's captured output.
    pub fn say(&mut self, line: impl AsRef<str>) {
        self.output.push_str(line.as_ref());
        self.output.push('\n');
    }

    /// Run a command, capping its timeout at the run's remaining budget and
    /// folding its output into the stage log. Non-zero exit is returned in
    /// the outcome, not as an error.
    pub fn run_command(&mut self, mut spec: CommandSpec) -> Result<ExecOutcome> {
        let remaining = self.remaining();
        spec.timeout = Some(spec.timeout.map_or(remaining, |t| t.min(remaining)));
        self.say(format!("$ {}", spec.display()));
        let outcome = self.runner.run(&spec)?;
        self.last_exit = outcome.status.code();
        if !outcome.stdout.is_empty() {
            self.output.push_str(&outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            self.output.push_str(&outcome.stderr);
        }
        Ok(outcome)
    }

    /// Run a command and treat any non-success exit condition as fatal for
    /// the stage.
    pub fn run_checked(&mut self, spec: CommandSpec) -> Result<ExecOutcome> {
        let rendered = spec.display();
        let outcome = self.run_command(spec)?;
        if !outcome.status.success() {
            bail!("'{rendered}' failed ({})", outcome.status);
        }
        Ok(outcome)
    }

    pub fn last_exit(&self) -> Option<i32> {
        self.last_exit
    }
}

/// The pipeline state machine: fixed stage order, first fatal failure halts
/// normal progression, cleanup and notification run on every exit path.
pub struct Scheduler {
    deadline: Duration,
    artifact_dir: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            artifact_dir: None,
        }
    }

    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    pub fn execute(
        &self,
        stages: &[StageDefinition],
        plan: &Plan,
        metadata: BuildMetadata,
        ctx: &RunContext,
        runner: Arc<dyn CommandRunner>,
        credentials: &CredentialStore,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(metadata.clone(), ctx.branch.clone());
        info!(
            run_id = %run.run_id,
            branch = %ctx.branch,
            image = %metadata.image_ref(),
            "Pipeline run started"
        );

        let hard_deadline = Instant::now() + self.deadline;
        let mut cleanup = CleanupStack::new();

        for stage in stages {
            if Instant::now() >= hard_deadline {
                warn!(stage = stage.name, "Run deadline exceeded");
                run.record(StageResult {
                    name: stage.name.to_string(),
                    status: StageStatus::Failed,
                    exit_code: None,
                    output: "run deadline exceeded".to_string(),
                    finished_at: Utc::now(),
                });
                run.set_outcome(RunOutcome::Failed {
                    stage: stage.name.to_string(),
                    reason: "run deadline exceeded".to_string(),
                });
                break;
            }

            if !stage.gate.should_run(ctx) {
                info!(
                    stage = stage.name,
                    gate = %stage.gate.describe(),
                    "Stage skipped"
                );
                run.record(StageResult::skipped(stage.name));
                continue;
            }

            info!(stage = stage.name, "Stage started");
            let mut sctx = StageContext {
                plan,
                metadata: &metadata,
                run: ctx,
                runner: runner.clone(),
                credentials,
                cleanup: &mut cleanup,
                deadline: hard_deadline,
                output: String::new(),
                last_exit: None,
            };

            let disposition = (stage.body)(&mut sctx);

            // Stage-scoped teardown runs no matter how the body fared;
            // its own failures are logged and swallowed.
            if let Some(post) = &stage.post
                && let Err(err) = post(&mut sctx)
            {
                warn!(stage = stage.name, error = %err, "Stage teardown failed");
            }

            let output = std::mem::take(&mut sctx.output);
            let exit_code = sctx.last_exit;
            drop(sctx);

            match disposition {
                Ok(StageDisposition::Done) => {
                    info!(stage = stage.name, "Stage passed");
                    run.record(StageResult {
                        name: stage.name.to_string(),
                        status: StageStatus::Passed,
                        exit_code,
                        output,
                        finished_at: Utc::now(),
                    });
                }
                Ok(StageDisposition::Warned(reason)) => {
                    warn!(stage = stage.name, %reason, "Stage passed with warning");
                    let mut output = output;
                    output.push_str(&format!("warning: {reason}\n"));
                    run.record(StageResult {
                        name: stage.name.to_string(),
                        status: StageStatus::PassedWithWarning,
                        exit_code,
                        output,
                        finished_at: Utc::now(),
                    });
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    error!(stage = stage.name, error = %reason, "Stage failed");
                    run.record(StageResult {
                        name: stage.name.to_string(),
                        status: StageStatus::Failed,
                        exit_code,
                        output,
                        finished_at: Utc::now(),
                    });
                    run.set_outcome(RunOutcome::Failed {
                        stage: stage.name.to_string(),
                        reason,
                    });
                    break;
                }
            }
        }

        if run.outcome().is_none() {
            run.set_outcome(RunOutcome::Succeeded);
        }

        // The guaranteed phase: teardown and the terminal report happen on
        // every path out of the stage loop, including early abort.
        cleanup.run_all();
        notify::report(&run);
        if let Some(dir) = &self.artifact_dir
            && let Err(err) = notify::archive(&run, dir)
        {
            warn!(error = %err, dir = %dir.display(), "Failed to archive run artifacts");
        }

        run
    }
}
