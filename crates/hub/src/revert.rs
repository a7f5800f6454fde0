// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The revert phase: tears the intermediate cluster down and returns the
//! source to service. How much work that takes depends on how far the
//! upgrade got and whether link mode let pg_upgrade write into the source's
//! files.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use uplift_cluster::{tools, Cluster};
use uplift_protocol::agent::{
    DeleteDataDirectoriesRequest, DeleteTablespaceDirectoriesRequest,
    RestorePrimariesPgControlRequest, RsyncPair, RsyncRequest,
};
use uplift_protocol::common::{Message, Phase, Substep};
use uplift_step::{has_run, MessageSender, Skip, Step};
use uplift_system::rsync::{Rsync, RESTORE_EXCLUDES, RESTORE_OPTIONS};
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;
use uplift_system::{fs, tablespaces};

use crate::agents::AgentConns;
use crate::config::Config;
use crate::finalize;

pub async fn run(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    sender: Arc<dyn MessageSender>,
) -> anyhow::Result<()> {
    let mut config = Config::load(state_dir)?;
    let conns = AgentConns::new(config.agent_port);

    // How far execute got decides what revert must undo.
    let coordinator_upgraded = has_run(state_dir, Phase::Execute, Substep::UpgradeCoordinator)?;
    let primaries_upgraded = has_run(state_dir, Phase::Execute, Substep::UpgradePrimaries)?;

    let mut step = Step::begin(state_dir, Phase::Revert, Arc::clone(&sender))?;

    step.run_internal(|| {
        let config = &config;
        async move {
            // Link mode writes into the source primaries; without a full set
            // of mirrors there is no pristine copy left to restore from.
            if config.use_link_mode
                && primaries_upgraded
                && !config.source.has_all_mirrors_and_standby()
            {
                anyhow::bail!(
                    "Source cluster does not have mirrors and/or standby. \
                     Cannot restore source cluster. Please contact support."
                );
            }
            Ok(())
        }
    })
    .await;

    step.always_run(Substep::ShutdownTargetCluster, |streams| {
        let config = &config;
        async move {
            let Some(intermediate) = &config.intermediate else {
                return Err(Skip.into());
            };
            if !intermediate
                .is_coordinator_running(runner, streams.as_ref())
                .await?
            {
                return Err(Skip.into());
            }
            intermediate.stop(runner, streams.as_ref()).await
        }
    })
    .await;

    step.run(Substep::RestoreSourceCluster, |streams| {
        let config = &config;
        let conns = &conns;
        async move {
            if !(config.use_link_mode && primaries_upgraded) {
                return Err(Skip.into());
            }
            restore_source_cluster(runner, streams.as_ref(), config, conns).await
        }
    })
    .await;

    step.run(Substep::RestorePgControl, |_| {
        let config = &config;
        let conns = &conns;
        async move {
            if !coordinator_upgraded {
                return Err(Skip.into());
            }
            restore_pg_control(config, conns).await
        }
    })
    .await;

    step.run(Substep::DeleteIntermediatePrimaryDatadirs, |streams| {
        let config = &config;
        let conns = &conns;
        async move {
            if config.intermediate.is_none() {
                return Err(Skip.into());
            }
            delete_intermediate_primary_datadirs(config, conns, streams.as_ref()).await
        }
    })
    .await;

    step.run(Substep::DeleteIntermediateCoordinatorDatadir, |streams| {
        let config = &config;
        async move {
            let Some(intermediate) = &config.intermediate else {
                return Err(Skip.into());
            };
            fs::delete_directories(
                &[intermediate.coordinator_data_dir().to_owned()],
                fs::POSTGRES_FILES,
                streams.as_ref(),
            )
        }
    })
    .await;

    step.run(Substep::StartSourceCluster, |streams| {
        let config = &config;
        async move {
            if config
                .source
                .is_coordinator_running(runner, streams.as_ref())
                .await?
            {
                return Err(Skip.into());
            }
            config.source.start(runner, streams.as_ref()).await
        }
    })
    .await;

    // 5X link-mode restores copy whole mirrors back; gprecoverseg brings
    // them back into sync incrementally.
    step.run(Substep::RecoverSourceMirrors, |streams| {
        let config = &config;
        async move {
            if !(config.source.version.major < 6 && config.use_link_mode && primaries_upgraded) {
                return Err(Skip.into());
            }
            runner
                .run(
                    tools::gprecoverseg(
                        &config.source.gphome,
                        config.source.coordinator_data_dir(),
                    ),
                    streams.as_ref(),
                )
                .await
                .context("recovering source mirrors")
        }
    })
    .await;

    step.run(Substep::ArchiveLogDirectories, |_| {
        let config = &mut config;
        let conns = &conns;
        async move { finalize::archive_log_directories(state_dir, config, conns).await }
    })
    .await;

    step.run(Substep::DeleteSegmentStateDirs, |_| {
        let config = &config;
        let conns = &conns;
        async move { finalize::delete_segment_state_dirs(config, conns).await }
    })
    .await;

    step.finish()?;

    let mut data = HashMap::new();
    data.insert(
        "port".to_string(),
        config.source.coordinator_port().to_string(),
    );
    data.insert(
        "coordinator-datadir".to_string(),
        config.source.coordinator_data_dir().to_string(),
    );
    data.insert("version".to_string(), config.source.version.to_string());
    if let Some(archive) = &config.log_archive_dir {
        data.insert("log-archive-directory".to_string(), archive.to_string());
    }
    sender.send(Message::response(data))
}

/// The rsync pairs that clone each surviving mirror back over its primary,
/// keyed by the host the copy originates on. The standby restores the
/// coordinator the same way.
fn restore_pairs(source: &Cluster) -> BTreeMap<String, Vec<RsyncPair>> {
    let mut pairs_by_host: BTreeMap<String, Vec<RsyncPair>> = BTreeMap::new();

    let mut push = |from: &uplift_cluster::Segment, to: &uplift_cluster::Segment| {
        pairs_by_host
            .entry(from.hostname.clone())
            .or_default()
            .push(RsyncPair {
                source: from.data_dir.clone().into_string(),
                destination_host: if to.hostname == from.hostname {
                    String::new()
                } else {
                    to.hostname.clone()
                },
                destination: to.data_dir.clone().into_string(),
            });
    };

    if let Some(standby) = source.standby() {
        push(standby, source.coordinator());
    }
    for mirror in source.mirrors().filter(|segment| segment.is_mirror()) {
        // Presence is checked before this substep runs.
        if let Some(primary) = source.primary_for_content(mirror.content) {
            push(mirror, primary);
        }
    }
    pairs_by_host
}

async fn restore_source_cluster(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    config: &Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    let coordinator_host = config.source.coordinator_hostname();
    let mut pairs_by_host = restore_pairs(&config.source);

    // Copies originating on the hub's host run right here; the hub carries
    // no agent of its own.
    if let Some(local) = pairs_by_host.remove(coordinator_host) {
        for pair in local {
            let invocation = Rsync::new()
                .source(Utf8Path::new(&pair.source))
                .destination(Utf8Path::new(&pair.destination))
                .destination_host(pair.destination_host)
                .options(RESTORE_OPTIONS.iter().copied())
                .excluded_files(RESTORE_EXCLUDES.iter().copied())
                .into_invocation()?;
            runner
                .run(invocation, streams)
                .await
                .context("restoring the source cluster")?;
        }
    }

    let hosts: Vec<String> = pairs_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let pairs = pairs_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .rsync_data_directories(RsyncRequest {
                        pairs,
                        options: RESTORE_OPTIONS.iter().map(|s| s.to_string()).collect(),
                        excluded_files: RESTORE_EXCLUDES.iter().map(|s| s.to_string()).collect(),
                    })
                    .await
                    .context("restoring data directories")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

/// Puts every set-aside `pg_control.old` back so the source postmasters can
/// start again.
async fn restore_pg_control(config: &Config, conns: &AgentConns) -> anyhow::Result<()> {
    let coordinator_host = config.source.coordinator_hostname();
    fs::restore_pg_control(config.source.coordinator_data_dir())?;

    let mut dirs_by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for primary in config.source.primaries().filter(|segment| segment.is_primary()) {
        if primary.is_on_host(coordinator_host) {
            fs::restore_pg_control(&primary.data_dir)?;
            continue;
        }
        dirs_by_host
            .entry(primary.hostname.clone())
            .or_default()
            .push(primary.data_dir.to_string());
    }

    let hosts: Vec<String> = dirs_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let datadirs = dirs_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .restore_primaries_pg_control(RestorePrimariesPgControlRequest { datadirs })
                    .await
                    .context("restoring pg_control")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

/// The versioned tablespace directories the upgrade created for one host's
/// primaries. Empty unless the source carried user-defined tablespaces.
fn tablespace_dirs_for_host(
    config: &Config,
    target_major: u64,
    catalog_version: &str,
    host: &str,
) -> Vec<String> {
    config
        .source
        .primaries()
        .filter(|segment| segment.is_primary() && segment.is_on_host(host))
        .flat_map(|primary| {
            config
                .tablespaces
                .user_defined_locations(primary.dbid)
                .into_iter()
                .map(move |location| {
                    tablespaces::tablespace_path(
                        location,
                        primary.dbid,
                        target_major,
                        catalog_version,
                    )
                    .into_string()
                })
        })
        .collect()
}

async fn delete_intermediate_primary_datadirs(
    config: &Config,
    conns: &AgentConns,
    streams: &dyn OutStreams,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let coordinator_host = config.source.coordinator_hostname();

    let mut local_dirs = Vec::new();
    let mut dirs_by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for primary in intermediate.primaries().filter(|segment| segment.is_primary()) {
        if primary.is_on_host(coordinator_host) {
            local_dirs.push(primary.data_dir.clone());
        } else {
            dirs_by_host
                .entry(primary.hostname.clone())
                .or_default()
                .push(primary.data_dir.to_string());
        }
    }
    fs::delete_directories(&local_dirs, fs::POSTGRES_FILES, streams)?;

    let hosts: Vec<String> = dirs_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let datadirs = dirs_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .delete_data_directories(DeleteDataDirectoriesRequest { datadirs })
                    .await
                    .context("deleting intermediate data directories")?;
                Ok(())
            }
        })
        .await?;

    // The upgrade also minted versioned tablespace directories next to the
    // source's own; they go with the intermediate cluster.
    if config.tablespaces.is_empty() {
        return Ok(());
    }
    let Some(catalog_version) = &config.target_catalog_version else {
        return Ok(());
    };

    let local_spaces: Vec<Utf8PathBuf> = tablespace_dirs_for_host(
        config,
        intermediate.version.major,
        catalog_version,
        coordinator_host,
    )
    .into_iter()
    .map(Utf8PathBuf::from)
    .collect();
    fs::delete_directories(&local_spaces, &[], streams)?;

    let hosts: Vec<String> = config
        .source
        .primary_hostnames()
        .into_iter()
        .filter(|host| host != coordinator_host)
        .collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let dirs =
                tablespace_dirs_for_host(config, intermediate.version.major, catalog_version, &host);
            async move {
                if dirs.is_empty() {
                    return Ok(());
                }
                client
                    .delete_tablespace_directories(DeleteTablespaceDirectoriesRequest { dirs })
                    .await
                    .context("deleting tablespace directories")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use semver::Version;
    use uplift_cluster::{Role, Segment, TablespaceInfo, Tablespaces};
    use uplift_types::UpgradeId;

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

    fn source() -> Cluster {
        Cluster::new(
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
        .unwrap()
    }

    fn config() -> Config {
        let source = source();
        let intermediate = crate::planner::plan(
            &source,
            &[],
            Utf8Path::new("/usr/local/gp6"),
            Version::new(6, 9, 0),
        )
        .unwrap();
        Config {
            upgrade_id: UpgradeId::from_raw(5),
            source,
            intermediate: Some(intermediate),
            target_gphome: Utf8PathBuf::from("/usr/local/gp6"),
            agent_port: 6416,
            use_link_mode: true,
            use_hba_hostnames: false,
            disk_free_ratio: 0.0,
            tablespaces: Tablespaces::new(),
            target_catalog_version: Some("301908232".to_string()),
            log_archive_dir: None,
        }
    }

    #[test]
    fn restore_pairs_originate_on_the_mirror_host() {
        let pairs = restore_pairs(&source());

        // The standby feeds the coordinator.
        let smdw = &pairs["smdw"];
        assert_eq!(smdw.len(), 1);
        assert_eq!(smdw[0].source, "/data/standby");
        assert_eq!(smdw[0].destination_host, "mdw");
        assert_eq!(smdw[0].destination, "/data/qd/seg-1");

        // Each mirror feeds its primary on the opposite host.
        let sdw2 = &pairs["sdw2"];
        assert_eq!(sdw2.len(), 1);
        assert_eq!(sdw2[0].source, "/data/m/seg0");
        assert_eq!(sdw2[0].destination_host, "sdw1");
        assert_eq!(sdw2[0].destination, "/data/p/seg0");
    }

    #[test]
    fn colocated_restores_are_local_copies() {
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

        let pairs = restore_pairs(&source);
        assert_eq!(pairs["sdw1"][0].destination_host, "");
    }

    #[test]
    fn tablespace_dirs_embed_dbid_and_catalog_version() {
        let mut config = config();
        config.tablespaces.insert(
            2,
            16385,
            TablespaceInfo {
                location: Utf8PathBuf::from("/fs/p0/16385"),
                user_defined: true,
            },
        );
        config.tablespaces.insert(
            2,
            1663,
            TablespaceInfo {
                location: Utf8PathBuf::from("/data/p/seg0"),
                user_defined: false,
            },
        );

        let dirs = tablespace_dirs_for_host(&config, 6, "301908232", "sdw1");
        assert_eq!(dirs, vec!["/fs/p0/16385/2/GPDB_6_301908232".to_string()]);

        assert!(tablespace_dirs_for_host(&config, 6, "301908232", "sdw2").is_empty());
    }
}
