// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A scripted [`CommandRunner`] for tests. Callers register outcomes per
//! program name and later assert on the exact invocations that were made.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::runner::{CapturedOutput, CommandRunner, ExecError, Invocation};
use crate::streams::OutStreams;

#[derive(Debug, Clone)]
struct ScriptedOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Records every invocation and replays registered outcomes. Programs with
/// no registered outcome succeed with empty output, so tests only script
/// what they care about.
#[derive(Default)]
pub struct ScriptedRunner {
    outcomes: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next run of `program` succeeds and writes `stdout`.
    pub fn respond(&self, program: &str, stdout: &str) {
        self.push(program, 0, stdout, "");
    }

    /// The next run of `program` exits with `exit_code` and writes `stderr`.
    pub fn fail(&self, program: &str, exit_code: i32, stderr: &str) {
        self.push(program, exit_code, "", stderr);
    }

    fn push(&self, program: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(ScriptedOutcome {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
    }

    /// Every invocation made so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// The invocations of a single program, in order.
    pub fn calls_of(&self, program: &str) -> Vec<Invocation> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|invocation| invocation.program == program)
            .cloned()
            .collect()
    }

    fn next_outcome(&self, invocation: &Invocation) -> ScriptedOutcome {
        self.calls.lock().unwrap().push(invocation.clone());
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(&invocation.program)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
    }
}

fn exit_status(code: i32) -> ExitStatus {
    ExitStatus::from_raw(code << 8)
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: Invocation, streams: &dyn OutStreams) -> Result<(), ExecError> {
        let command = invocation.to_string();
        let outcome = self.next_outcome(&invocation);

        let _ = streams.stdout().write_all(outcome.stdout.as_bytes());
        let _ = streams.stderr().write_all(outcome.stderr.as_bytes());

        if outcome.exit_code != 0 {
            return Err(ExecError::Failed {
                command,
                status: exit_status(outcome.exit_code),
                stderr: outcome.stderr,
            });
        }
        Ok(())
    }

    async fn capture(&self, invocation: Invocation) -> Result<CapturedOutput, ExecError> {
        let outcome = self.next_outcome(&invocation);
        Ok(CapturedOutput {
            status: exit_status(outcome.exit_code),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::BufferedStreams;

    #[tokio::test]
    async fn unscripted_programs_succeed() {
        let runner = ScriptedRunner::new();
        runner
            .run(Invocation::new("gpstart").arg("-a"), &BufferedStreams::new())
            .await
            .unwrap();

        assert_eq!(runner.calls_of("gpstart").len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_replayed_in_order() {
        let runner = ScriptedRunner::new();
        runner.fail("pg_upgrade", 1, "mismatch");
        runner.respond("pg_upgrade", "");

        let streams = BufferedStreams::new();
        let err = runner
            .run(Invocation::new("pg_upgrade"), &streams)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed { .. }));
        assert_eq!(streams.stderr_contents(), "mismatch");

        runner
            .run(Invocation::new("pg_upgrade"), &streams)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capture_replays_stdout() {
        let runner = ScriptedRunner::new();
        runner.respond("pgrep", "1234\n");

        let out = runner.capture(Invocation::new("pgrep")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "1234\n");
    }
}
