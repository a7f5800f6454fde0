// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use anyhow::Context;
use camino::Utf8Path;

use uplift_system::runner::{CommandRunner, Invocation};

const VERSION_MARKER: &str = "postgres (Greenplum Database) ";

/// Asks the installation under `gphome` for its version.
pub async fn local_version(
    runner: &dyn CommandRunner,
    gphome: &Utf8Path,
) -> anyhow::Result<semver::Version> {
    let invocation = Invocation::new(gphome.join("bin").join("postgres").as_str())
        .arg("--gp-version")
        .clear_env();
    let command = invocation.to_string();

    let out = runner.capture(invocation).await?;
    if !out.success() {
        anyhow::bail!(
            "{command:?} failed with {:?}: {}",
            out.stderr,
            out.status
        );
    }

    parse_version(&out.stdout)
}

/// Extracts the semantic version from `postgres --gp-version` output, e.g.
/// `postgres (Greenplum Database) 6.9.0 build commit:a21de28`.
pub fn parse_version(raw: &str) -> anyhow::Result<semver::Version> {
    let rest = raw
        .trim()
        .split_once(VERSION_MARKER)
        .map(|(_, rest)| rest)
        .with_context(|| {
            format!(r#"Greenplum version {raw:?} is not of the form "{VERSION_MARKER}#.#.#""#)
        })?;

    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let digits = digits.trim_end_matches('.');

    semver::Version::parse(digits)
        .with_context(|| format!("parsing Greenplum version {raw:?}"))
}
