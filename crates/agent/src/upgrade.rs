// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Upgrading the primaries on this host. Each primary gets the upgraded
//! coordinator catalog restored into its target directory, its user-defined
//! tablespaces restored from the coordinator's copies, and then a
//! segment-mode run of the page-format tool.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;

use uplift_cluster::tools::{PgUpgrade, PgUpgradeMode};
use uplift_protocol::agent::{DataDirPair, UpgradePrimariesRequest};
use uplift_system::rsync::Rsync;
use uplift_system::{fs, paths, CommandRunner, DevNullStreams};
use uplift_types::ErrorList;

/// Runtime files the coordinator backup must not clobber on a segment.
const BACKUP_EXCLUDES: &[&str] = &[
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
];

pub async fn upgrade_primaries(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    request: &UpgradePrimariesRequest,
) -> anyhow::Result<()> {
    let host = fs::hostname();

    let upgrades = request
        .data_dir_pairs
        .iter()
        .map(|pair| upgrade_segment(runner, state_dir, request, pair, &host));

    join_all(upgrades)
        .await
        .into_iter()
        .filter_map(|result| result.err())
        .collect::<ErrorList>()
        .into_result()
}

async fn upgrade_segment(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
    host: &str,
) -> anyhow::Result<()> {
    restore_backup(runner, request, pair).await.with_context(|| {
        format!(
            "restoring coordinator backup on host {host} for content id {}",
            pair.content
        )
    })?;

    restore_tablespaces(runner, request, pair)
        .await
        .with_context(|| {
            format!(
                "restoring tablespaces on host {host} for content id {}",
                pair.content
            )
        })?;

    let action = if request.check_only { "check" } else { "upgrade" };
    perform_upgrade(runner, state_dir, request, pair)
        .await
        .with_context(|| {
            format!(
                "{action} primary on host {host} with content {}",
                pair.content
            )
        })
}

/// Replaces the target catalog with the upgraded coordinator's copy. Skipped
/// in check mode, where nothing was upgraded yet.
async fn restore_backup(
    runner: &dyn CommandRunner,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
) -> anyhow::Result<()> {
    if request.check_only {
        return Ok(());
    }

    let invocation = Rsync::new()
        .source(&request.coordinator_backup_dir)
        .destination(&pair.target_data_dir)
        .options(["--archive", "--delete"])
        .excluded_files(BACKUP_EXCLUDES.iter().copied())
        .into_invocation()?;

    runner.run(invocation, &DevNullStreams).await?;
    Ok(())
}

/// Restores the coordinator's upgraded copy of every user-defined
/// tablespace into this segment's location and points the `pg_tblspc`
/// symlink at it.
async fn restore_tablespaces(
    runner: &dyn CommandRunner,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
) -> anyhow::Result<()> {
    if request.check_only {
        return Ok(());
    }

    let backup_root = Utf8Path::new(&request.tablespaces_mapping_file_path)
        .parent()
        .context("tablespaces mapping file has no parent directory")?;

    for tablespace in &pair.tablespaces {
        if !tablespace.user_defined {
            continue;
        }

        let target = Utf8Path::new(&tablespace.location).join(pair.dbid.to_string());
        let source = coordinator_tablespace_backup(backup_root, tablespace.oid);

        let invocation = Rsync::new()
            .source(&source)
            .destination(&target)
            .options(["--archive", "--delete"])
            .into_invocation()?;
        runner
            .run(invocation, &DevNullStreams)
            .await
            .context("restoring coordinator tablespace into segment tablespace")?;

        let link = Utf8Path::new(&pair.target_data_dir)
            .join("pg_tblspc")
            .join(tablespace.oid.to_string());
        recreate_symlink(&target, &link)?;
    }

    Ok(())
}

/// Where the hub parked the coordinator's copy of one tablespace:
/// `<state dir>/tablespaces/<oid>/<coordinator dbid>`.
fn coordinator_tablespace_backup(backup_root: &Utf8Path, oid: u32) -> Utf8PathBuf {
    backup_root
        .join(oid.to_string())
        .join(uplift_cluster::COORDINATOR_DBID.to_string())
}

fn recreate_symlink(target: &Utf8Path, link: &Utf8Path) -> anyhow::Result<()> {
    match link.symlink_metadata() {
        Ok(_) => std::fs::remove_file(link.as_std_path())
            .with_context(|| format!("unlinking {link}"))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(anyhow::Error::new(err).context(format!("checking {link}"))),
    }

    std::os::unix::fs::symlink(target.as_std_path(), link.as_std_path())
        .with_context(|| format!("linking {link} to {target}"))
}

async fn perform_upgrade(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    request: &UpgradePrimariesRequest,
    pair: &DataDirPair,
) -> anyhow::Result<()> {
    let working_dir = paths::pg_upgrade_segment_dir(state_dir, pair.content);
    std::fs::create_dir_all(working_dir.as_std_path())
        .with_context(|| format!("creating {working_dir}"))?;

    // The mapping file is shipped to the segments only after the
    // coordinator upgrade, so check mode must not ask for it.
    let tablespaces_file = (!request.check_only)
        .then(|| request.tablespaces_mapping_file_path.clone());

    let invocation = PgUpgrade {
        source_bindir: request.source_bindir.clone(),
        target_bindir: request.target_bindir.clone(),
        source_dbid: pair.dbid,
        target_dbid: pair.dbid,
        source_data_dir: pair.source_data_dir.clone(),
        target_data_dir: pair.target_data_dir.clone(),
        source_port: pair.source_port,
        target_port: pair.target_port,
        mode: PgUpgradeMode::Segment,
        check_only: request.check_only,
        use_link_mode: request.use_link_mode,
        tablespaces_file,
        old_options: None,
        working_dir: working_dir.into_string(),
    }
    .into_invocation();

    runner.run(invocation, &DevNullStreams).await?;
    Ok(())
}
