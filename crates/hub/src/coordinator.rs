// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Coordinator-side upgrade work the hub runs itself: snapshotting the
//! freshly initialized intermediate coordinator, running the page-format
//! tool in dispatcher mode, and shipping the result out to the segment
//! hosts so their primaries can start from the upgraded catalog.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::future::join_all;

use uplift_cluster::tools::{PgUpgrade, PgUpgradeMode};
use uplift_cluster::Cluster;
use uplift_system::rsync::{Rsync, COPY_OPTIONS};
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;
use uplift_system::paths;
use uplift_types::{ErrorList, NextActionError};

use crate::config::Config;

/// The clean post-init copy of the intermediate coordinator directory, kept
/// in the hub's state directory.
pub const COORDINATOR_BACKUP_NAME: &str = "coordinator.bak";

/// Where the upgraded coordinator directory lands in each segment host's
/// state directory.
pub const SEGMENT_BACKUP_NAME: &str = "upgraded-coordinator.bak";

pub fn backup_dir(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join(COORDINATOR_BACKUP_NAME)
}

pub fn segment_backup_dir(state_dir: &Utf8PathBuf) -> Utf8PathBuf {
    state_dir.join(SEGMENT_BACKUP_NAME)
}

/// Snapshots the intermediate coordinator directory right after init, while
/// its catalog is still untouched. Execute restores from this copy so a
/// failed upgrade attempt can always be retried from a clean slate.
pub async fn backup(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    intermediate: &Cluster,
) -> anyhow::Result<()> {
    let invocation = Rsync::new()
        .source(intermediate.coordinator_data_dir())
        .destination(backup_dir(state_dir))
        .options(["--archive", "--delete"])
        .into_invocation()?;
    runner
        .run(invocation, streams)
        .await
        .context("backing up the coordinator directory")
}

async fn restore_backup(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    intermediate: &Cluster,
) -> anyhow::Result<()> {
    let invocation = Rsync::new()
        .source(backup_dir(state_dir))
        .destination(intermediate.coordinator_data_dir())
        .options(["--archive", "--delete"])
        .excluded_files(["pg_log/*"])
        .into_invocation()?;
    runner
        .run(invocation, streams)
        .await
        .context("restoring the coordinator directory")
}

/// Runs pg_upgrade against the coordinator pair, in check or upgrade mode.
/// Outside of check mode the intermediate directory is first reset from the
/// clean backup.
pub async fn upgrade(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    config: &Config,
    check_only: bool,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;

    if !check_only {
        restore_backup(runner, streams, state_dir, intermediate).await?;
    }

    let working_dir = paths::pg_upgrade_segment_dir(state_dir, -1);
    std::fs::create_dir_all(working_dir.as_std_path())
        .with_context(|| format!("creating {working_dir}"))?;

    let source = config.source.coordinator();
    let target = intermediate.coordinator();

    // Pre-6X catalogs carry the standby's WAL sender; it must not migrate.
    let old_options = config
        .source
        .standby()
        .filter(|_| config.source.version.major < 6)
        .map(|standby| format!("-x {}", standby.dbid));

    let tablespaces_file = (!config.tablespaces.is_empty())
        .then(|| paths::tablespaces_mapping_path(state_dir).into_string());

    let invocation = PgUpgrade {
        source_bindir: config.source.gphome.join("bin").into_string(),
        target_bindir: intermediate.gphome.join("bin").into_string(),
        source_dbid: source.dbid,
        target_dbid: target.dbid,
        source_data_dir: source.data_dir.clone().into_string(),
        target_data_dir: target.data_dir.clone().into_string(),
        source_port: source.port,
        target_port: target.port,
        mode: PgUpgradeMode::Dispatcher,
        check_only,
        use_link_mode: config.use_link_mode,
        tablespaces_file,
        old_options,
        working_dir: working_dir.clone().into_string(),
    }
    .into_invocation();

    runner.run(invocation, streams).await.map_err(|err| {
        if check_only {
            let err = anyhow::Error::new(err).context("checking the source cluster");
            anyhow::Error::new(NextActionError::new(err, check_next_action(&working_dir)))
        } else {
            anyhow::Error::new(err).context("upgrading the coordinator")
        }
    })
}

fn check_next_action(working_dir: &Utf8Path) -> String {
    format!(
        "Refer to the pg_upgrade check output under {working_dir} for the failing checks, \
         correct them on the source cluster, and re-run \"uplift initialize\"."
    )
}

/// Ships the upgraded coordinator directory, and the coordinator's copies of
/// the user-defined tablespaces, to every primary host. One rsync per host
/// and source, run concurrently within each batch.
pub async fn copy_to_segments(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    config: &Config,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let hosts = config.agent_hosts();

    copy_to_hosts(
        runner,
        streams,
        &hosts,
        intermediate.coordinator_data_dir(),
        &segment_backup_dir(state_dir),
    )
    .await
    .context("copying the coordinator directory")?;

    if config.tablespaces.is_empty() {
        return Ok(());
    }

    // The mapping directory goes first; the per-oid copies land inside it.
    copy_to_hosts(
        runner,
        streams,
        &hosts,
        &paths::tablespaces_dir(state_dir),
        &paths::tablespaces_dir(state_dir),
    )
    .await
    .context("copying the tablespace mapping")?;

    let coordinator_spaces = config.tablespaces.coordinator();
    for (oid, info) in coordinator_spaces.iter().flat_map(|spaces| spaces.iter()) {
        if !info.user_defined {
            continue;
        }
        copy_to_hosts(
            runner,
            streams,
            &hosts,
            &info.location,
            &paths::tablespaces_dir(state_dir).join(oid.to_string()),
        )
        .await
        .with_context(|| format!("copying tablespace {oid}"))?;
    }
    Ok(())
}

async fn copy_to_hosts(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    hosts: &[String],
    source: &Utf8Path,
    destination: &Utf8Path,
) -> anyhow::Result<()> {
    let copies = hosts.iter().map(|host| async move {
        let invocation = Rsync::new()
            .source(source)
            .destination(destination)
            .destination_host(host.clone())
            .options(COPY_OPTIONS.iter().copied())
            .into_invocation()?;
        runner
            .run(invocation, streams)
            .await
            .with_context(|| format!("copying {source} to host {host}"))?;
        Ok(())
    });

    join_all(copies)
        .await
        .into_iter()
        .filter_map(|result: anyhow::Result<()>| result.err())
        .collect::<ErrorList>()
        .into_result()
}
