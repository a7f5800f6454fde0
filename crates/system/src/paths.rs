// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Layout of the per-host state directory and the operator-facing log
//! directory. Both live under the service user's home so the hub and every
//! agent resolve the same paths independently.

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use uplift_types::UpgradeId;

pub const CONFIG_FILE: &str = "config.json";
pub const STATUS_FILE: &str = "status.json";

/// Overrides the default state directory location, mainly for tests.
pub const STATE_DIR_ENV: &str = "GPUPGRADE_HOME";

/// The state directory holding config.json, status.json, phase logs, and
/// tool working directories. `$GPUPGRADE_HOME` wins; otherwise
/// `$HOME/.gpupgrade`.
pub fn state_dir() -> Utf8PathBuf {
    match std::env::var(STATE_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Utf8PathBuf::from(dir),
        _ => home_dir().join(".gpupgrade"),
    }
}

/// Where operator-visible logs land. Kept outside the state directory so it
/// survives `DELETE_SEGMENT_STATE_DIRS`.
pub fn log_dir() -> Utf8PathBuf {
    home_dir().join("gpAdminLogs").join("gpupgrade")
}

fn home_dir() -> Utf8PathBuf {
    Utf8PathBuf::from(std::env::var("HOME").unwrap_or_default())
}

pub fn config_path(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join(CONFIG_FILE)
}

pub fn status_path(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join(STATUS_FILE)
}

/// Per-segment scratch directory for pg_upgrade; `content` is the segment's
/// content id, so the coordinator lands in `pg_upgrade/seg-1`.
pub fn pg_upgrade_segment_dir(state_dir: &Utf8PathBuf, content: i32) -> Utf8PathBuf {
    state_dir.join("pg_upgrade").join(format!("seg{content}"))
}

/// Holds the 5X tablespace mapping file plus the per-oid coordinator
/// tablespace backups shipped to the segment hosts.
pub fn tablespaces_dir(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join("tablespaces")
}

pub fn tablespaces_mapping_path(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    tablespaces_dir(state_dir).join("tablespaces.txt")
}

pub fn add_mirrors_config_path(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join("add_mirrors_config")
}

pub fn initsystem_config_path(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join("gpinitsystem_config")
}

/// Name of the archived log directory left behind after finalize or revert.
/// Minute precision is enough; two upgrades on one host within the same
/// minute share an id anyway.
pub fn archive_log_dir_name(id: UpgradeId, when: DateTime<Utc>) -> String {
    format!("uplift-{id}-{}", when.format("%Y-%m-%dT%H:%M"))
}

/// Creates the state directory if needed. Fails when it exists but does not
/// look like one of ours, so a stray directory is never silently adopted.
pub fn ensure_state_dir(state_dir: &Utf8PathBuf) -> anyhow::Result<()> {
    if crate::fs::path_exists(state_dir) {
        let recognized = crate::fs::STATE_DIRECTORY_FILES
            .iter()
            .any(|file| crate::fs::path_exists(&state_dir.join(file)));
        let empty = state_dir
            .read_dir_utf8()
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        anyhow::ensure!(
            recognized || empty,
            "state directory {state_dir} exists but does not look like an upgrade state directory"
        );
        return Ok(());
    }
    std::fs::create_dir_all(state_dir.as_std_path())
        .with_context(|| format!("creating state directory {state_dir}"))?;
    Ok(())
}
