use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to collect output of '{program}': {source}")]
    Capture {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// One external command invocation. Stdin is redacted from all rendered
/// forms so secrets fed to a child never reach the logs.
#[derive(Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
    /// Marks commands whose arguments carry secrets; every rendered form
    /// shows the program name only.
    pub sensitive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Loggable rendering: program and arguments, unless marked sensitive.
    pub fn display(&self) -> String {
        if self.sensitive {
            return format!("{} <args redacted>", self.program);
        }
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: &dyn fmt::Debug = if self.sensitive {
            &"<redacted>"
        } else {
            &self.args
        };
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", args)
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    Completed(i32),
    TimedOut,
}

impl ExitCondition {
    pub fn success(&self) -> bool {
        matches!(self, ExitCondition::Completed(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitCondition::Completed(code) => Some(*code),
            ExitCondition::TimedOut => None,
        }
    }
}

impl fmt::Display for ExitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCondition::Completed(code) => write!(f, "exit code {code}"),
            ExitCondition::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug)]
pub struct ExecOutcome {
    pub status: ExitCondition,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Seam between stage logic and the host's process table. Non-zero exit is
/// reported in the outcome, not as an error; only failures to spawn or
/// capture are `Err`. Retry policy belongs to callers.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<ExecOutcome, ExecError>;
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ExecOutcome, ExecError> {
        let started = Instant::now();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        if let Some(data) = &spec.stdin
            && let Some(mut handle) = child.stdin.take()
        {
            // A child that exits before reading its stdin closes the pipe;
            // that is not a capture failure.
            let _ = handle.write_all(data);
        }

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let status = wait_with_timeout(&mut child, spec)?;
        let stdout = join_pipe(stdout, spec)?;
        let stderr = join_pipe(stderr, spec)?;
        let duration = started.elapsed();

        debug!(
            command = %spec.display(),
            %status,
            duration_ms = duration.as_millis() as u64,
            "Command finished"
        );

        Ok(ExecOutcome {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

fn wait_with_timeout(child: &mut Child, spec: &CommandSpec) -> Result<ExitCondition, ExecError> {
    let deadline = spec.timeout.map(|t| Instant::now() + t);
    loop {
        let exited = child.try_wait().map_err(|source| ExecError::Capture {
            program: spec.program.clone(),
            source,
        })?;
        if let Some(status) = exited {
            // A signal-terminated child carries no code; report the
            // conventional shell encoding.
            return Ok(ExitCondition::Completed(status.code().unwrap_or(-1)));
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ExitCondition::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = reader.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>, spec: &CommandSpec) -> Result<String, ExecError> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    let bytes = handle.join().map_err(|_| ExecError::Capture {
        program: spec.program.clone(),
        source: std::io::Error::other("output reader thread panicked"),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_zero_exit() {
        let outcome = ProcessRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo ready"]))
            .unwrap();
        assert_eq!(outcome.status, ExitCondition::Completed(0));
        assert!(outcome.status.success());
        assert_eq!(outcome.stdout.trim(), "ready");
    }

    #[test]
    fn non_zero_exit_is_reported_not_raised() {
        let outcome = ProcessRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(outcome.status, ExitCondition::Completed(3));
        assert_eq!(outcome.status.code(), Some(3));
        assert_eq!(outcome.stderr.trim(), "oops");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessRunner
            .run(&CommandSpec::new("slipway-test-no-such-binary"))
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn expired_timeout_kills_the_child() {
        let outcome = ProcessRunner
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "sleep 30"])
                    .timeout(Duration::from_millis(200)),
            )
            .unwrap();
        assert_eq!(outcome.status, ExitCondition::TimedOut);
        assert_eq!(outcome.status.code(), None);
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[test]
    fn stdin_is_fed_to_the_child_and_redacted_in_debug() {
        let spec = CommandSpec::new("cat").stdin("hunter2");
        let outcome = ProcessRunner.run(&spec).unwrap();
        assert_eq!(outcome.stdout, "hunter2");
        let debugged = format!("{spec:?}");
        assert!(!debugged.contains("hunter2"));
        assert!(debugged.contains("<redacted>"));
    }

    #[test]
    fn sensitive_specs_render_program_only() {
        let spec = CommandSpec::new("docker")
            .args(["login", "-u", "ci-bot"])
            .sensitive();
        assert_eq!(spec.display(), "docker <args redacted>");
        assert!(!format!("{spec:?}").contains("ci-bot"));
    }

    #[test]
    fn env_and_working_dir_are_applied() {
        let temp = tempfile::tempdir().unwrap();
        let outcome = ProcessRunner
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "echo $SLIPWAY_PROBE; pwd"])
                    .env("SLIPWAY_PROBE", "on")
                    .current_dir(temp.path()),
            )
            .unwrap();
        assert!(outcome.stdout.starts_with("on\n"));
        assert!(outcome.stdout.contains(
            temp.path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
        ));
    }
}
