// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Data directory primitives: the rename scheme that swaps the intermediate
//! cluster into place, guarded deletes, and atomic small-file writes.

use std::io::Write;
use std::os::unix::fs::DirBuilderExt;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};

use uplift_types::ErrorList;

use crate::streams::OutStreams;

/// Suffix appended to a source data directory when it is archived out of the
/// way during finalize.
pub const OLD_SUFFIX: &str = "_old";

/// Suffix spliced into the parent of a data directory to house the
/// intermediate cluster's copy.
pub const UPGRADE_SUFFIX: &str = "_upgrade";

/// Files that must exist before we are willing to rename or delete a
/// directory as a postgres data directory.
pub const POSTGRES_FILES: &[&str] = &["postgresql.conf", "PG_VERSION"];

/// Files that mark a directory as an upgrade state directory.
pub const STATE_DIRECTORY_FILES: &[&str] = &["config.json", "status.json"];

#[derive(Debug, thiserror::Error)]
#[error("{path:?} does not look like a postgres directory. Failed to find {missing:?}")]
pub struct InvalidDataDirectory {
    pub path: Utf8PathBuf,
    pub missing: &'static str,
}

/// Where the intermediate cluster's copy of `datadir` lives: the upgrade
/// suffix goes on the parent so every sibling segment shares one scratch
/// tree per filesystem.
pub fn upgrade_data_dir(datadir: &Utf8Path) -> Utf8PathBuf {
    let base = datadir.file_name().unwrap_or_default();
    match datadir.parent() {
        Some(parent) if !parent.as_str().is_empty() && parent.as_str() != "/" => {
            Utf8PathBuf::from(format!("{parent}{UPGRADE_SUFFIX}")).join(base)
        }
        _ => Utf8PathBuf::from(format!("{datadir}{UPGRADE_SUFFIX}")),
    }
}

/// Where a source data directory is parked during finalize.
pub fn archive_data_dir(datadir: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{datadir}{OLD_SUFFIX}"))
}

pub fn path_exists(path: &Utf8Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// True when a rename already happened on a previous attempt: the source is
/// gone and the archive is present.
pub fn already_renamed(source: &Utf8Path, archive: &Utf8Path) -> bool {
    !path_exists(source) && path_exists(archive)
}

/// Fails unless the directory carries the marker files of a postgres data
/// directory. All missing markers are reported, not just the first.
pub fn verify_data_directory(path: &Utf8Path) -> anyhow::Result<()> {
    let mut errs = ErrorList::new();
    for file in POSTGRES_FILES {
        if !path_exists(&path.join(file)) {
            errs.push(
                InvalidDataDirectory {
                    path: path.to_owned(),
                    missing: file,
                }
                .into(),
            );
        }
    }
    errs.into_result()
}

fn rename_data_directory(source: &Utf8Path, target: &Utf8Path) -> anyhow::Result<()> {
    verify_data_directory(source)?;
    std::fs::rename(source.as_std_path(), target.as_std_path())
        .with_context(|| format!("renaming {source} to {target}"))?;
    Ok(())
}

/// Archives `source` under the `_old` suffix and, when `rename_target` is
/// set, moves `target` into the vacated spot. Safe to rerun: a completed
/// half of the swap is detected and skipped. A missing source with no
/// archive also skips straight to the target rename; link mode deletes the
/// source mirror directories before the swap.
pub fn archive_source(source: &Utf8Path, target: &Utf8Path, rename_target: bool) -> anyhow::Result<()> {
    let archive = archive_data_dir(source);

    if path_exists(source) {
        rename_data_directory(source, &archive)?;
    }
    if rename_target && path_exists(target) {
        rename_data_directory(target, source)?;
    }
    Ok(())
}

/// Undoes pg_upgrade's rename of the control file, which it sets aside as
/// `pg_control.old` so the source cluster cannot start mid-upgrade. A copy
/// that was never set aside, or already restored, is left alone.
pub fn restore_pg_control(datadir: &Utf8Path) -> anyhow::Result<()> {
    let old = datadir.join("global").join("pg_control.old");
    let current = datadir.join("global").join("pg_control");

    if already_renamed(&old, &current) {
        return Ok(());
    }
    std::fs::rename(old.as_std_path(), current.as_std_path())
        .with_context(|| format!("restoring {current}"))?;
    Ok(())
}

/// Creates a segment data directory with the 0700 mode postgres insists on.
/// Already existing is fine; a rerun after a crash must not fail here.
pub fn create_data_directory(datadir: &Utf8Path) -> anyhow::Result<()> {
    if path_exists(datadir) {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(datadir.as_std_path())
        .with_context(|| format!("creating data directory {datadir}"))?;
    Ok(())
}

/// Removes each directory after checking that every required marker file is
/// present inside it. Missing directories are skipped; everything else is
/// collected into one error list so one bad directory does not mask the
/// rest.
pub fn delete_directories(
    directories: &[Utf8PathBuf],
    required_paths: &[&str],
    streams: &dyn OutStreams,
) -> anyhow::Result<()> {
    let hostname = hostname();
    let mut stdout = streams.stdout();
    let mut errs = ErrorList::new();

    for directory in directories {
        let _ = writeln!(stdout, "Deleting directory: {hostname}:{directory}");
        if !path_exists(directory) {
            let _ = writeln!(stdout, "Directory not found, skipping: {hostname}:{directory}");
            continue;
        }

        let mut missing = ErrorList::new();
        for required in required_paths {
            let path = directory.join(required);
            if !path_exists(&path) {
                missing.push(anyhow::anyhow!("{path} does not exist"));
            }
        }
        if let Err(err) = missing.into_result() {
            errs.push(err);
            continue;
        }

        if let Err(err) = std::fs::remove_dir_all(directory.as_std_path()) {
            errs.push(anyhow::Error::new(err).context(format!("removing {directory}")));
        }
    }

    errs.into_result()
}

/// Writes `contents` to `path` through a rename so readers never observe a
/// partial file.
pub fn atomic_write(path: &Utf8Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => bail!("cannot atomically write to {path}: no parent directory"),
    };

    let mut file = tempfile::NamedTempFile::new_in(parent.as_std_path())
        .with_context(|| format!("creating temporary file in {parent}"))?;
    file.write_all(contents)
        .with_context(|| format!("writing temporary file for {path}"))?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("syncing temporary file for {path}"))?;
    file.persist(path.as_std_path())
        .with_context(|| format!("replacing {path}"))?;
    Ok(())
}

pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}
