// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Re-establishing mirrors on the intermediate cluster during finalize. A
//! 5X source rebuilds them with gpaddmirrors; the catalog representation
//! changed too much between 5X and 6X to do better. Newer sources rsync
//! each upgraded primary over its mirror and register the mirrors in the
//! catalog directly, which avoids a full data copy in link mode.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::info;

use uplift_cluster::connection::{service_user, ConnectionOptions};
use uplift_cluster::{fts, tools, Cluster};
use uplift_protocol::agent::{
    AddReplicationEntriesRequest, CreateRecoveryConfRequest, RecoveryConfInfo, ReplicationEntry,
    RsyncPair, RsyncRequest,
};
use uplift_system::rsync::MIRROR_REBUILD_OPTIONS;
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;
use uplift_system::{fs, paths};

use crate::agents::AgentConns;
use crate::catalog;
use crate::config::Config;

/// Runtime files the rebuild must not clone from the primary.
const REBUILD_EXCLUDES: &[&str] = &["pg_log/*", "postmaster.pid", "postmaster.opts"];

pub async fn upgrade_mirrors(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    config: &Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    if config.source.version.major < 6 {
        add_mirrors_with_gpaddmirrors(runner, streams, state_dir, config, intermediate).await
    } else {
        rebuild_mirrors(runner, streams, config, conns, intermediate).await
    }
}

/// One `content|host|port|datadir` line per mirror; the standby is handled
/// by gpinitstandby and excluded here.
fn render_add_mirrors_config(intermediate: &Cluster) -> String {
    let mut out = String::new();
    for mirror in intermediate.mirrors().filter(|segment| segment.is_mirror()) {
        let _ = writeln!(
            out,
            "{}|{}|{}|{}",
            mirror.content, mirror.hostname, mirror.port, mirror.data_dir
        );
    }
    out
}

async fn add_mirrors_with_gpaddmirrors(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    config: &Config,
    intermediate: &Cluster,
) -> anyhow::Result<()> {
    let config_path = paths::add_mirrors_config_path(state_dir);
    fs::atomic_write(&config_path, render_add_mirrors_config(intermediate).as_bytes())?;

    runner
        .run(
            tools::gpaddmirrors(&intermediate.gphome, &config_path, config.use_hba_hostnames),
            streams,
        )
        .await
        .context("running gpaddmirrors")?;

    wait_for_sync(intermediate).await
}

async fn wait_for_sync(intermediate: &Cluster) -> anyhow::Result<()> {
    let client = ConnectionOptions::new(
        intermediate.coordinator_port(),
        intermediate.version.clone(),
    )
    .connect()
    .await?;
    fts::wait_for_mirrors(fts::MIRROR_SYNC_TIMEOUT, || {
        fts::mirrors_synchronized(&client)
    })
    .await
}

/// The rsync pairs that clone each upgraded primary over its mirror, keyed
/// by the host whose agent runs them (the primary's host). A mirror sharing
/// the primary's host gets a local pair.
fn rebuild_pairs(intermediate: &Cluster) -> BTreeMap<String, Vec<RsyncPair>> {
    let mut pairs_by_host: BTreeMap<String, Vec<RsyncPair>> = BTreeMap::new();
    for primary in intermediate.primaries().filter(|segment| segment.is_primary()) {
        let Some(mirror) = intermediate.mirror_for_content(primary.content) else {
            continue;
        };
        pairs_by_host
            .entry(primary.hostname.clone())
            .or_default()
            .push(RsyncPair {
                source: primary.data_dir.clone().into_string(),
                destination_host: if mirror.hostname == primary.hostname {
                    String::new()
                } else {
                    mirror.hostname.clone()
                },
                destination: mirror.data_dir.clone().into_string(),
            });
    }
    pairs_by_host
}

fn recovery_infos(intermediate: &Cluster) -> anyhow::Result<BTreeMap<String, Vec<RecoveryConfInfo>>> {
    let user = service_user();
    let mut infos_by_host: BTreeMap<String, Vec<RecoveryConfInfo>> = BTreeMap::new();
    for mirror in intermediate.mirrors().filter(|segment| segment.is_mirror()) {
        let primary = intermediate
            .primary_for_content(mirror.content)
            .with_context(|| format!("no primary for content {}", mirror.content))?;
        infos_by_host
            .entry(mirror.hostname.clone())
            .or_default()
            .push(RecoveryConfInfo {
                target_primary_hostname: primary.hostname.clone(),
                target_primary_port: primary.port,
                user: user.clone(),
                mirror_data_dir: mirror.data_dir.clone().into_string(),
            });
    }
    Ok(infos_by_host)
}

fn replication_entries(intermediate: &Cluster) -> BTreeMap<String, Vec<ReplicationEntry>> {
    let user = service_user();
    let mut entries_by_host: BTreeMap<String, Vec<ReplicationEntry>> = BTreeMap::new();
    for primary in intermediate.primaries().filter(|segment| segment.is_primary()) {
        let Some(mirror) = intermediate.mirror_for_content(primary.content) else {
            continue;
        };
        entries_by_host
            .entry(primary.hostname.clone())
            .or_default()
            .push(ReplicationEntry {
                data_dir: primary.data_dir.clone().into_string(),
                user: user.clone(),
                host_addrs: vec![mirror.hostname.clone()],
            });
    }
    entries_by_host
}

async fn rebuild_mirrors(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    config: &Config,
    conns: &AgentConns,
    intermediate: &Cluster,
) -> anyhow::Result<()> {
    {
        let client = ConnectionOptions::new(
            intermediate.coordinator_port(),
            intermediate.version.clone(),
        )
        .connect()
        .await
        .context("connecting to the intermediate coordinator")?;
        catalog::recreate_replication_slots(&client).await?;
    }

    // Everything below copies files; the postmasters must be down.
    intermediate.stop(runner, streams).await?;

    let pairs_by_host = rebuild_pairs(intermediate);
    let hosts: Vec<String> = pairs_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let pairs = pairs_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .rsync_data_directories(RsyncRequest {
                        pairs,
                        options: MIRROR_REBUILD_OPTIONS.iter().map(|s| s.to_string()).collect(),
                        excluded_files: REBUILD_EXCLUDES.iter().map(|s| s.to_string()).collect(),
                    })
                    .await
                    .context("rsyncing mirror data directories")?;
                Ok(())
            }
        })
        .await?;

    let infos_by_host = recovery_infos(intermediate)?;
    let mirror_hosts: Vec<String> = infos_by_host.keys().cloned().collect();
    conns
        .fan_out(&mirror_hosts, |host, mut client| {
            let infos = infos_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .create_recovery_conf(CreateRecoveryConfRequest { infos })
                    .await
                    .context("creating recovery configuration")?;
                Ok(())
            }
        })
        .await?;

    let entries_by_host = replication_entries(intermediate);
    let primary_hosts: Vec<String> = entries_by_host.keys().cloned().collect();
    conns
        .fan_out(&primary_hosts, |host, mut client| {
            let entries = entries_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .add_replication_entries(AddReplicationEntriesRequest { entries })
                    .await
                    .context("adding replication entries")?;
                Ok(())
            }
        })
        .await?;

    // Register the mirrors while only the coordinator runs, then bring the
    // whole cluster up and let FTS synchronize them.
    intermediate.start_coordinator_only(runner, streams).await?;
    {
        let client = ConnectionOptions::new(
            intermediate.coordinator_port(),
            intermediate.version.clone(),
        )
        .utility_mode()
        .allow_system_table_mods()
        .connect()
        .await?;
        catalog::add_mirror_rows(&client, intermediate).await?;
    }
    intermediate.stop_coordinator_only(runner, streams).await?;

    intermediate.start(runner, streams).await?;
    info!("waiting for mirrors to synchronize");
    wait_for_sync(intermediate).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use semver::Version;
    use uplift_cluster::{Role, Segment};

    fn seg(dbid: i32, content: i32, port: i32, host: &str, dir: &str, role: Role) -> Segment {
        Segment {
            dbid,
            content,
            port,
            hostname: host.to_string(),
            data_dir: Utf8PathBuf::from(dir),
            role,
        }
    }

    fn intermediate() -> Cluster {
        let source = Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(6, -1, 5433, "smdw", "/data/standby", Role::Mirror),
                seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
                seg(3, 1, 6000, "sdw2", "/data/p/seg1", Role::Primary),
                seg(4, 0, 7000, "sdw2", "/data/m/seg0", Role::Mirror),
                seg(5, 1, 7000, "sdw1", "/data/m/seg1", Role::Mirror),
            ],
            "/usr/local/gp5",
            Version::new(5, 29, 10),
        )
        .unwrap();
        crate::planner::plan(
            &source,
            &[],
            Utf8Path::new("/usr/local/gp6"),
            Version::new(6, 9, 0),
        )
        .unwrap()
    }

    #[test]
    fn gpaddmirrors_config_lists_mirrors_without_the_standby() {
        let rendered = render_add_mirrors_config(&intermediate());

        assert_eq!(
            rendered,
            "0|sdw2|50435|/data/m_upgrade/seg0\n1|sdw1|50435|/data/m_upgrade/seg1\n"
        );
        assert!(!rendered.contains("standby"));
    }

    #[test]
    fn rebuild_pairs_run_on_the_primary_host_and_cross_to_the_mirror() {
        let pairs = rebuild_pairs(&intermediate());

        assert_eq!(pairs.len(), 2);
        let sdw1 = &pairs["sdw1"];
        assert_eq!(sdw1.len(), 1);
        assert_eq!(sdw1[0].source, "/data/p_upgrade/seg0");
        assert_eq!(sdw1[0].destination_host, "sdw2");
        assert_eq!(sdw1[0].destination, "/data/m_upgrade/seg0");
    }

    #[test]
    fn colocated_mirrors_rsync_locally() {
        let source = Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
                seg(3, 0, 7000, "sdw1", "/data/m/seg0", Role::Mirror),
            ],
            "/usr/local/gp6",
            Version::new(6, 9, 0),
        )
        .unwrap();
        let intermediate = crate::planner::plan(
            &source,
            &[],
            Utf8Path::new("/usr/local/gp6.21"),
            Version::new(6, 21, 0),
        )
        .unwrap();

        let pairs = rebuild_pairs(&intermediate);
        assert_eq!(pairs["sdw1"][0].destination_host, "");
    }

    #[test]
    fn recovery_infos_point_each_mirror_at_its_primary() {
        let infos = recovery_infos(&intermediate()).unwrap();

        let on_sdw2 = &infos["sdw2"];
        assert_eq!(on_sdw2.len(), 1);
        assert_eq!(on_sdw2[0].target_primary_hostname, "sdw1");
        assert_eq!(on_sdw2[0].target_primary_port, 50434);
        assert_eq!(on_sdw2[0].mirror_data_dir, "/data/m_upgrade/seg0");
    }

    #[test]
    fn replication_entries_open_the_primary_to_its_mirror_host() {
        let entries = replication_entries(&intermediate());

        assert_eq!(entries["sdw1"][0].data_dir, "/data/p_upgrade/seg0");
        assert_eq!(entries["sdw1"][0].host_addrs, vec!["sdw2".to_string()]);
    }
}
