use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::pipeline::{PipelineRun, RunOutcome, StageStatus};

const SUMMARY_FILE: &str = "summary.json";

/// Emit the terminal run report. Invoked exactly once per run; never fails —
/// an undeliverable report must not change the run's recorded outcome.
pub fn report(run: &PipelineRun) {
    match run.outcome() {
        Some(RunOutcome::Succeeded) => info!(
            run_id = %run.run_id,
            branch = %run.branch,
            vcs_ref = %run.metadata.vcs_ref,
            image = %run.metadata.image_ref(),
            started_at = %run.started_at.to_rfc3339(),
            "Pipeline succeeded"
        ),
        Some(RunOutcome::Failed { stage, reason }) => error!(
            run_id = %run.run_id,
            branch = %run.branch,
            vcs_ref = %run.metadata.vcs_ref,
            image = %run.metadata.image_ref(),
            started_at = %run.started_at.to_rfc3339(),
            failed_stage = %stage,
            %reason,
            "Pipeline failed"
        ),
        None => warn!(
            run_id = %run.run_id,
            "Pipeline finished without a recorded outcome"
        ),
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: &'a str,
    branch: &'a str,
    vcs_ref: &'a str,
    image: String,
    started_at: String,
    outcome: Option<&'a RunOutcome>,
    stages: Vec<StageLine>,
}

#[derive(Serialize)]
struct StageLine {
    name: String,
    status: StageStatus,
    exit_code: Option<i32>,
    finished_at: String,
    output_file: Option<String>,
}

/// Archive the run log as operator-facing artifacts: one output file per
/// stage that produced output, a JSON summary, and a fingerprint of the
/// summary. Written on every outcome.
pub fn archive(run: &PipelineRun, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;

    let mut stages = Vec::with_capacity(run.stage_log().len());
    for (ordinal, result) in run.stage_log().iter().enumerate() {
        let output_file = if result.output.is_empty() {
            None
        } else {
            let file_name = format!("{:02}-{}.log", ordinal + 1, result.name);
            std::fs::write(dir.join(&file_name), &result.output).with_context(|| {
                format!("Failed to write stage output file: {file_name}")
            })?;
            Some(file_name)
        };
        stages.push(StageLine {
            name: result.name.clone(),
            status: result.status,
            exit_code: result.exit_code,
            finished_at: result.finished_at.to_rfc3339(),
            output_file,
        });
    }

    let summary = RunSummary {
        run_id: &run.run_id,
        branch: &run.branch,
        vcs_ref: &run.metadata.vcs_ref,
        image: run.metadata.image_ref(),
        started_at: run.started_at.to_rfc3339(),
        outcome: run.outcome(),
        stages,
    };

    let summary_path = dir.join(SUMMARY_FILE);
    let file = File::create(&summary_path)
        .with_context(|| format!("Failed to create summary file: {}", summary_path.display()))?;
    serde_json::to_writer_pretty(file, &summary)
        .with_context(|| format!("Failed to write summary JSON: {}", summary_path.display()))?;

    fingerprint_summary(dir)?;

    info!(dir = %dir.display(), "Run artifacts archived");
    Ok(())
}

/// Streaming SHA256 of the archived summary, written checksum-file style
/// (`<digest>  summary.json`) next to it so consumers can verify the archive.
fn fingerprint_summary(dir: &Path) -> Result<()> {
    let summary_path = dir.join(SUMMARY_FILE);
    let file = File::open(&summary_path)
        .with_context(|| format!("Failed to open summary for hashing: {}", summary_path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = format!("{:x}", hasher.finalize());

    let digest_path = dir.join(format!("{SUMMARY_FILE}.sha256"));
    std::fs::write(&digest_path, format!("{digest}  {SUMMARY_FILE}\n"))
        .with_context(|| format!("Failed to write digest file: {}", digest_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{RunContext, RunParams};
    use crate::metadata::BuildMetadata;
    use crate::pipeline::{Scheduler, StageContext, StageDefinition, StageDisposition};
    use crate::plan::Plan;
    use crate::{credentials::CredentialStore, exec::ProcessRunner, gates::Gate};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn executed_run(fail: bool) -> PipelineRun {
        let plan = Plan::from_yaml("version: 1\nimage:\n  name: webapp\n").unwrap();
        let metadata = BuildMetadata::resolve(&plan, Some("main"), &HashMap::new());
        let ctx = RunContext {
            branch: "main".to_string(),
            params: RunParams::default(),
        };
        let stages = vec![StageDefinition::new(
            "build",
            Gate::Always,
            move |ctx: &mut StageContext<'_>| {
                ctx.say("building image");
                if fail {
                    anyhow::bail!("boom")
                }
                Ok(StageDisposition::Done)
            },
        )];
        Scheduler::new(Duration::from_secs(60)).execute(
            &stages,
            &plan,
            metadata,
            &ctx,
            Arc::new(ProcessRunner),
            &CredentialStore::from_map(HashMap::new()),
        )
    }

    #[test]
    fn archive_writes_summary_outputs_and_fingerprint() {
        let temp = tempdir().unwrap();
        let run = executed_run(false);

        archive(&run, temp.path()).unwrap();

        let summary = std::fs::read_to_string(temp.path().join("summary.json")).unwrap();
        assert!(summary.contains("\"result\": \"succeeded\""));
        assert!(summary.contains("01-build.log"));
        assert!(temp.path().join("summary.json.sha256").is_file());
        let stage_output = std::fs::read_to_string(temp.path().join("01-build.log")).unwrap();
        assert!(stage_output.contains("building image"));
    }

    #[test]
    fn fingerprint_line_matches_the_summary_digest() {
        let temp = tempdir().unwrap();
        let run = executed_run(false);

        archive(&run, temp.path()).unwrap();

        let summary = std::fs::read(temp.path().join("summary.json")).unwrap();
        let digest = format!("{:x}", Sha256::digest(&summary));
        let line = std::fs::read_to_string(temp.path().join("summary.json.sha256")).unwrap();
        assert_eq!(line.trim(), format!("{digest}  summary.json"));
    }

    #[test]
    fn archive_is_written_for_failed_runs_too() {
        let temp = tempdir().unwrap();
        let run = executed_run(true);
        assert!(!run.succeeded());

        archive(&run, temp.path()).unwrap();

        let summary = std::fs::read_to_string(temp.path().join("summary.json")).unwrap();
        assert!(summary.contains("\"result\": \"failed\""));
        assert!(summary.contains("\"stage\": \"build\""));
    }
}
