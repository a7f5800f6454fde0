// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-place configuration file rewrites. Both the hub (for the coordinator)
//! and the agents (for the segments) patch ports in postgresql.conf and the
//! recovery configuration with the same sed substitution.

use futures::future::join_all;

use uplift_types::ErrorList;

use crate::runner::{CommandRunner, Invocation};
use crate::streams::DevNullStreams;

/// One substitution applied to one file. The pattern is an extended regular
/// expression; `@` is the delimiter, so neither side may contain one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfEdit {
    pub path: String,
    pub pattern: String,
    pub replacement: String,
}

impl ConfEdit {
    /// Rewrites a `port = N` assignment, leaving commented lines and
    /// settings that merely end in "port" alone.
    pub fn port(path: impl Into<String>, old: i32, new: i32) -> Self {
        ConfEdit {
            path: path.into(),
            pattern: format!(r"(^port[ \t]*=[ \t]*){old}([^0-9]|$)"),
            replacement: format!(r"\1{new}\2"),
        }
    }

    /// Rewrites the port inside a `primary_conninfo` connection string.
    pub fn primary_conninfo_port(path: impl Into<String>, old: i32, new: i32) -> Self {
        ConfEdit {
            path: path.into(),
            pattern: format!(r"(primary_conninfo .* port[ \t]*=[ \t]*){old}([^0-9]|$)"),
            replacement: format!(r"\1{new}\2"),
        }
    }
}

pub fn sed_invocation(edit: &ConfEdit) -> Invocation {
    Invocation::new("sed")
        .arg("-E")
        .arg("-i.bak")
        .arg(format!("s@{}@{}@", edit.pattern, edit.replacement))
        .arg(&edit.path)
}

/// Applies every edit, concurrently, and reports all failures.
pub async fn apply_edits(runner: &dyn CommandRunner, edits: &[ConfEdit]) -> anyhow::Result<()> {
    let rewrites = edits.iter().map(|edit| async move {
        runner.run(sed_invocation(edit), &DevNullStreams).await?;
        Ok(())
    });

    join_all(rewrites)
        .await
        .into_iter()
        .filter_map(|result: anyhow::Result<()>| result.err())
        .collect::<ErrorList>()
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    #[test]
    fn port_edit_renders_the_expected_substitution() {
        let edit = ConfEdit::port("/data/seg1/postgresql.conf", 6001, 50433);
        let invocation = sed_invocation(&edit);

        assert_eq!(invocation.program, "sed");
        assert_eq!(
            invocation.args,
            vec![
                "-E",
                "-i.bak",
                r"s@(^port[ \t]*=[ \t]*)6001([^0-9]|$)@\150433\2@",
                "/data/seg1/postgresql.conf",
            ]
        );
    }

    #[tokio::test]
    async fn every_edit_runs_even_when_one_fails() {
        let runner = ScriptedRunner::new();
        runner.fail("sed", 1, "sed: no such file");

        let edits = vec![
            ConfEdit::port("/data/seg1/postgresql.conf", 6001, 50433),
            ConfEdit::primary_conninfo_port("/data/m1/postgresql.auto.conf", 6001, 50433),
        ];

        let err = apply_edits(&runner, &edits).await.unwrap_err();

        assert_eq!(runner.calls_of("sed").len(), 2);
        assert!(err.to_string().contains("no such file"));
    }
}
