//! Child process execution
//!
//! [`ProcessRunner`] is the seam between device tooling and the OS: the
//! `simctl` wrapper and toolchain discovery only ever go through it, so
//! tests substitute a scripted runner.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use rdbg_core::prelude::*;

/// Per-invocation options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Kill the child and fail after this long; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Extra variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion.
///
/// A non-zero exit fails with [`Error::Process`] carrying the child's stderr.
#[trait_variant::make(ProcessRunner: Send)]
pub trait LocalProcessRunner {
    async fn run(&self, command: &str, args: &[String], options: RunOptions)
        -> Result<ProcessOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: &str,
        args: &[String],
        options: RunOptions,
    ) -> Result<ProcessOutput> {
        let command_line = display_command(command, args);
        debug!("Running: {}", command_line);

        let child = Command::new(command)
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::process_spawn(command_line.clone(), e.to_string()))?;

        let output = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| Error::timeout(format!("'{command_line}' after {limit:?}")))?,
            None => child.wait_with_output().await,
        }?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            warn!("'{}' exited with {}", command_line, output.status);
            return Err(Error::process(command_line, stderr.trim()));
        }

        Ok(ProcessOutput { stdout, stderr })
    }
}

fn display_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::{display_command, ProcessRunner, RunOptions, TokioProcessRunner};
    use rdbg_core::Error;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_display_command() {
        assert_eq!(display_command("xcrun", &[]), "xcrun");
        assert_eq!(
            display_command("xcrun", &args(&["simctl", "list"])),
            "xcrun simctl list"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = TokioProcessRunner
            .run("sh", &args(&["-c", "echo hello"]), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_failure_carries_stderr() {
        let err = TokioProcessRunner
            .run(
                "sh",
                &args(&["-c", "echo 'No devices are booted.' >&2; exit 3"]),
                RunOptions::default(),
            )
            .await
            .unwrap_err();
        match err {
            Error::Process { command, stderr } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "No devices are booted.");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_passes_extra_env() {
        let options = RunOptions::default().env(vec![("RDBG_TEST_VAR".into(), "42".into())]);
        let output = TokioProcessRunner
            .run("sh", &args(&["-c", "echo $RDBG_TEST_VAR"]), options)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let options = RunOptions::with_timeout(Some(Duration::from_millis(50)));
        let err = TokioProcessRunner
            .run("sleep", &args(&["5"]), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_missing_binary_is_spawn_error() {
        let err = TokioProcessRunner
            .run("rdbg-no-such-binary", &[], RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
    }
}
