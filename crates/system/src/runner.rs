// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Subprocess dispatch. Every external tool the upgrade runs goes through
//! [`CommandRunner`], so tests can swap in a scripted runner and assert on
//! the exact invocations without touching the host.

use std::fmt;
use std::io::Write;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::streams::OutStreams;

/// A fully resolved command line: program, arguments, and any extra
/// environment entries. Building one never touches the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory for the child. `None` inherits ours.
    pub current_dir: Option<String>,
    /// Start the child from an empty environment instead of inheriting.
    /// pg_upgrade forbids PGPORT and friends, so its invocations set this.
    pub clear_env: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            clear_env: false,
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
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{key}={value} ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("\"{command}\" failed: {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("forwarding output of \"{command}\": {source}")]
    Stream {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// The result of [`CommandRunner::capture`]. A non-zero exit is reported
/// here rather than as an error so probes (pgrep, version checks) can branch
/// on it.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation to completion, teeing its output into `streams`.
    /// A non-zero exit status is an error; the tail of stderr is carried in
    /// the error message since the streams may be write-only.
    async fn run(&self, invocation: Invocation, streams: &dyn OutStreams) -> Result<(), ExecError>;

    /// Runs the invocation and hands back whatever it wrote, along with the
    /// exit status.
    async fn capture(&self, invocation: Invocation) -> Result<CapturedOutput, ExecError>;
}

/// Runs invocations as real subprocesses on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

impl LocalRunner {
    fn command(invocation: &Invocation) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        if invocation.clear_env {
            cmd.env_clear();
        }
        if let Some(dir) = &invocation.current_dir {
            cmd.current_dir(dir);
        }
        cmd.args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Substeps may be cancelled mid-flight; do not leave the tool
            // running when the future is dropped.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, invocation: Invocation, streams: &dyn OutStreams) -> Result<(), ExecError> {
        let command = invocation.to_string();
        debug!(%command, "executing");

        let mut child = Self::command(&invocation)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (_, stderr_tail, status) = tokio::try_join!(
            forward(stdout, streams.stdout(), &command, false),
            forward(stderr, streams.stderr(), &command, true),
            async {
                child.wait().await.map_err(|source| ExecError::Stream {
                    command: command.clone(),
                    source,
                })
            }
        )?;

        if !status.success() {
            return Err(ExecError::Failed {
                command,
                status,
                stderr: stderr_tail,
            });
        }
        Ok(())
    }

    async fn capture(&self, invocation: Invocation) -> Result<CapturedOutput, ExecError> {
        let command = invocation.to_string();
        debug!(%command, "executing");

        let output = Self::command(&invocation)
            .output()
            .await
            .map_err(|source| ExecError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(CapturedOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Pumps a child pipe into a sink, keeping a bounded tail for error
/// reporting when `keep_tail` is set.
async fn forward(
    mut reader: impl AsyncReadExt + Unpin,
    mut writer: Box<dyn Write + Send>,
    command: &str,
    keep_tail: bool,
) -> Result<String, ExecError> {
    const TAIL_LIMIT: usize = 8 * 1024;

    let mut tail = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await.map_err(|source| ExecError::Stream {
            command: command.to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|source| ExecError::Stream {
                command: command.to_string(),
                source,
            })?;
        if keep_tail {
            tail.extend_from_slice(&buf[..n]);
            if tail.len() > TAIL_LIMIT {
                tail.drain(..tail.len() - TAIL_LIMIT);
            }
        }
    }
    Ok(String::from_utf8_lossy(&tail).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::BufferedStreams;

    #[test]
    fn invocation_display_includes_env_and_args() {
        let invocation = Invocation::new("/usr/local/bin/gpstart")
            .args(["-a", "-d", "/data/qd/seg-1"])
            .env("MASTER_DATA_DIRECTORY", "/data/qd/seg-1");

        assert_eq!(
            invocation.to_string(),
            "MASTER_DATA_DIRECTORY=/data/qd/seg-1 /usr/local/bin/gpstart -a -d /data/qd/seg-1"
        );
    }

    #[tokio::test]
    async fn run_tees_output_into_the_streams() {
        let streams = BufferedStreams::new();
        LocalRunner
            .run(
                Invocation::new("sh").args(["-c", "echo out; echo err >&2"]),
                &streams,
            )
            .await
            .unwrap();

        assert_eq!(streams.stdout_contents(), "out\n");
        assert_eq!(streams.stderr_contents(), "err\n");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_with_stderr_tail() {
        let streams = BufferedStreams::new();
        let err = LocalRunner
            .run(
                Invocation::new("sh").args(["-c", "echo broken >&2; exit 3"]),
                &streams,
            )
            .await
            .unwrap_err();

        match err {
            ExecError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "broken\n");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn capture_surfaces_exit_status_without_error() {
        let out = LocalRunner
            .capture(Invocation::new("sh").args(["-c", "echo found; exit 1"]))
            .await
            .unwrap();

        assert!(!out.success());
        assert_eq!(out.stdout, "found\n");
    }
}
