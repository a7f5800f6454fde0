// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The finalize phase: re-establishes the standby and mirrors on the
//! upgraded cluster, then swaps it onto the source's ports and data
//! directories. After finalize the source cluster is gone; only the
//! archived `_old` directories remain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::debug;

use uplift_cluster::connection::ConnectionOptions;
use uplift_cluster::{Cluster, Role, Segment};
use uplift_protocol::agent::{
    ArchiveLogDirectoryRequest, ConfFileEdit, DeleteDataDirectoriesRequest,
    DeleteStateDirectoryRequest, RenameDirectoriesRequest, RenamePair,
    UpdateConfigurationRequest,
};
use uplift_protocol::common::{Message, Phase, Substep};
use uplift_step::{MessageSender, Skip, Step};
use uplift_system::conf::{self, ConfEdit};
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;
use uplift_system::{fs, paths};
use uplift_types::ErrorList;

use crate::agents::AgentConns;
use crate::config::Config;
use crate::{catalog, mirrors, standby};

pub async fn run(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    sender: Arc<dyn MessageSender>,
) -> anyhow::Result<()> {
    let mut config = Config::load(state_dir)?;
    let conns = AgentConns::new(config.agent_port);

    let mut step = Step::begin(state_dir, Phase::Finalize, Arc::clone(&sender))?;

    step.run(Substep::UpgradeStandby, |streams| {
        let config = &config;
        async move {
            if !config.source.has_standby() {
                return Err(Skip.into());
            }
            standby::upgrade_standby(
                runner,
                streams.as_ref(),
                config.intermediate()?,
                config.use_hba_hostnames,
            )
            .await
        }
    })
    .await;

    step.run(Substep::UpgradeMirrors, |streams| {
        let config = &config;
        let conns = &conns;
        async move {
            if !config.source.has_mirrors() {
                return Err(Skip.into());
            }
            mirrors::upgrade_mirrors(runner, streams.as_ref(), state_dir, config, conns).await
        }
    })
    .await;

    step.run(Substep::ShutdownTargetCoordinator, |streams| {
        let config = &config;
        async move { config.intermediate()?.stop(runner, streams.as_ref()).await }
    })
    .await;

    step.run(Substep::UpdateCatalogAndClusterConfig, |streams| {
        let config = &config;
        async move { update_catalog(runner, streams.as_ref(), config).await }
    })
    .await;

    step.run(Substep::RenameDataDirectories, |streams| {
        let config = &config;
        let conns = &conns;
        async move { rename_data_directories(config, conns, streams.as_ref()).await }
    })
    .await;

    step.run(Substep::UpdateConfFiles, |_| {
        let config = &config;
        let conns = &conns;
        async move { update_conf_files(runner, config, conns).await }
    })
    .await;

    step.run(Substep::StartFinalCluster, |streams| {
        let config = &config;
        async move {
            config
                .target_cluster()?
                .start(runner, streams.as_ref())
                .await
        }
    })
    .await;

    step.run(Substep::ArchiveLogDirectories, |_| {
        let config = &mut config;
        let conns = &conns;
        async move { archive_log_directories(state_dir, config, conns).await }
    })
    .await;

    step.run(Substep::DeleteSegmentStateDirs, |_| {
        let config = &config;
        let conns = &conns;
        async move { delete_segment_state_dirs(config, conns).await }
    })
    .await;

    step.finish()?;

    let intermediate = config.intermediate()?;
    let mut data = HashMap::new();
    data.insert(
        "port".to_string(),
        config.source.coordinator_port().to_string(),
    );
    data.insert(
        "coordinator-datadir".to_string(),
        config.source.coordinator_data_dir().to_string(),
    );
    data.insert("version".to_string(), intermediate.version.to_string());
    data.insert(
        "archived-source-coordinator-datadir".to_string(),
        fs::archive_data_dir(config.source.coordinator_data_dir()).into_string(),
    );
    data.insert("upgrade-id".to_string(), config.upgrade_id.to_string());
    if let Some(archive) = &config.log_archive_dir {
        data.insert("log-archive-directory".to_string(), archive.to_string());
    }
    sender.send(Message::response(data))
}

/// Rewrites the intermediate catalog so every segment claims the source's
/// port and data directory, with only the coordinator postmaster up.
async fn update_catalog(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    config: &Config,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let target = config.target_cluster()?;

    intermediate.start_coordinator_only(runner, streams).await?;

    let updated = async {
        let client = ConnectionOptions::new(
            intermediate.coordinator_port(),
            intermediate.version.clone(),
        )
        .utility_mode()
        .allow_system_table_mods()
        .connect()
        .await?;
        catalog::update_segment_configuration(&client, &target).await
    }
    .await;

    let stopped = intermediate.stop_coordinator_only(runner, streams).await;
    ErrorList::combine(updated, stopped)
}

fn planned_segment<'a>(
    intermediate: &'a Cluster,
    source: &Segment,
) -> anyhow::Result<&'a Segment> {
    let planned = match source.role {
        Role::Primary => intermediate.primary_for_content(source.content),
        Role::Mirror => intermediate.mirror_for_content(source.content),
    };
    planned.with_context(|| {
        format!(
            "no planned segment for content {} ({})",
            source.content,
            source.role.code()
        )
    })
}

/// The archive-and-swap pairs for every segment not on the hub's own host,
/// keyed by the host whose agent performs them.
fn rename_pairs(config: &Config) -> anyhow::Result<BTreeMap<String, Vec<RenamePair>>> {
    let intermediate = config.intermediate()?;
    let coordinator_host = config.source.coordinator_hostname();

    let mut pairs_by_host: BTreeMap<String, Vec<RenamePair>> = BTreeMap::new();
    for source in config.source.select(|_| true) {
        if source.is_on_host(coordinator_host) {
            continue;
        }
        let planned = planned_segment(intermediate, source)?;
        pairs_by_host
            .entry(source.hostname.clone())
            .or_default()
            .push(RenamePair {
                source: source.data_dir.to_string(),
                target: planned.data_dir.to_string(),
                rename_target: true,
            });
    }
    Ok(pairs_by_host)
}

async fn rename_data_directories(
    config: &Config,
    conns: &AgentConns,
    streams: &dyn OutStreams,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let coordinator_host = config.source.coordinator_hostname();

    // Link mode hard-linked the upgraded primaries into the source files, so
    // the source mirrors and standby no longer hold an independent copy.
    // They are deleted outright instead of archived.
    if config.use_link_mode {
        let doomed = config
            .source
            .select(|segment| segment.is_mirror() || segment.is_standby());

        let local: Vec<Utf8PathBuf> = doomed
            .iter()
            .filter(|segment| segment.is_on_host(coordinator_host))
            .map(|segment| segment.data_dir.clone())
            .collect();
        fs::delete_directories(&local, fs::POSTGRES_FILES, streams)?;

        let mut dirs_by_host: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for segment in doomed {
            if segment.is_on_host(coordinator_host) {
                continue;
            }
            dirs_by_host
                .entry(segment.hostname.clone())
                .or_default()
                .push(segment.data_dir.to_string());
        }
        let hosts: Vec<String> = dirs_by_host.keys().cloned().collect();
        conns
            .fan_out(&hosts, |host, mut client| {
                let datadirs = dirs_by_host.get(&host).cloned().unwrap_or_default();
                async move {
                    client
                        .delete_data_directories(DeleteDataDirectoriesRequest { datadirs })
                        .await
                        .context("deleting source mirror directories")?;
                    Ok(())
                }
            })
            .await?;
    }

    // Local swaps, the coordinator included.
    for source in config.source.segments_on(coordinator_host) {
        let planned = planned_segment(intermediate, source)?;
        fs::archive_source(&source.data_dir, &planned.data_dir, true)?;
    }

    let pairs_by_host = rename_pairs(config)?;
    let hosts: Vec<String> = pairs_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let dirs = pairs_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .rename_directories(RenameDirectoriesRequest { dirs })
                    .await
                    .context("renaming data directories")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

fn conninfo_file(target_major: u64) -> &'static str {
    if target_major < 7 {
        "recovery.conf"
    } else {
        "postgresql.auto.conf"
    }
}

/// The coordinator's own rewrites: its listener port, and the gpperfmon log
/// location that still points into the renamed `_upgrade` tree.
fn coordinator_conf_edits(config: &Config) -> anyhow::Result<Vec<ConfEdit>> {
    let intermediate = config.intermediate()?;
    let datadir = config.source.coordinator_data_dir();

    let mut edits = vec![ConfEdit::port(
        datadir.join("postgresql.conf").into_string(),
        intermediate.coordinator_port(),
        config.source.coordinator_port(),
    )];

    let gpperfmon = datadir.join("gpperfmon").join("conf").join("gpperfmon.conf");
    if intermediate.version.major < 7 && fs::path_exists(&gpperfmon) {
        edits.push(ConfEdit {
            path: gpperfmon.into_string(),
            pattern: "(^log_location = ).*".to_string(),
            replacement: format!(r"\1{datadir}/gpperfmon/logs"),
        });
    }
    Ok(edits)
}

/// Port rewrites for every non-coordinator segment on one host. The swap
/// already happened, so the files live at the source paths while their
/// contents still carry the temporary ports.
pub(crate) fn conf_edits_for_host(config: &Config, host: &str) -> anyhow::Result<Vec<ConfEdit>> {
    let intermediate = config.intermediate()?;
    let mut edits = Vec::new();

    for source in config.source.segments_on(host) {
        if source.is_coordinator() {
            continue;
        }
        let planned = planned_segment(intermediate, source)?;

        edits.push(ConfEdit::port(
            source.data_dir.join("postgresql.conf").into_string(),
            planned.port,
            source.port,
        ));

        if source.role == Role::Mirror {
            let source_primary = config
                .source
                .primary_for_content(source.content)
                .with_context(|| format!("no primary for content {}", source.content))?;
            let planned_primary = intermediate
                .primary_for_content(source.content)
                .with_context(|| format!("no planned primary for content {}", source.content))?;
            edits.push(ConfEdit::primary_conninfo_port(
                source
                    .data_dir
                    .join(conninfo_file(intermediate.version.major))
                    .into_string(),
                planned_primary.port,
                source_primary.port,
            ));
        }
    }
    Ok(edits)
}

async fn update_conf_files(
    runner: &dyn CommandRunner,
    config: &Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    let mut local = coordinator_conf_edits(config)?;
    local.extend(conf_edits_for_host(
        config,
        config.source.coordinator_hostname(),
    )?);
    conf::apply_edits(runner, &local).await?;

    let mut edits_by_host: BTreeMap<String, Vec<ConfFileEdit>> = BTreeMap::new();
    for host in config.agent_hosts() {
        let edits: Vec<ConfFileEdit> = conf_edits_for_host(config, &host)?
            .into_iter()
            .map(|edit| ConfFileEdit {
                path: edit.path,
                pattern: edit.pattern,
                replacement: edit.replacement,
            })
            .collect();
        if !edits.is_empty() {
            edits_by_host.insert(host, edits);
        }
    }
    let hosts: Vec<String> = edits_by_host.keys().cloned().collect();
    conns
        .fan_out(&hosts, |host, mut client| {
            let edits = edits_by_host.get(&host).cloned().unwrap_or_default();
            async move {
                client
                    .update_configuration(UpdateConfigurationRequest { edits })
                    .await
                    .context("updating configuration files")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

/// Parks the log directory under a per-upgrade archive name. The name is
/// persisted on first use so a rerun reuses the same archive. Shared with
/// revert.
pub(crate) async fn archive_log_directories(
    state_dir: &Utf8PathBuf,
    config: &mut Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    let archive = match &config.log_archive_dir {
        Some(archive) => archive.clone(),
        None => {
            let log_dir = paths::log_dir();
            let parent = log_dir
                .parent()
                .with_context(|| format!("log directory {log_dir} has no parent"))?;
            let archive = parent.join(paths::archive_log_dir_name(config.upgrade_id, Utc::now()));
            config.log_archive_dir = Some(archive.clone());
            config.save(state_dir)?;
            archive
        }
    };

    match std::fs::rename(paths::log_dir().as_std_path(), archive.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("log directory not archived: {err}");
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("archiving logs to {archive}")));
        }
    }

    conns
        .fan_out(&config.agent_hosts(), |_, mut client| {
            let log_dir = archive.clone().into_string();
            async move {
                client
                    .archive_log_directory(ArchiveLogDirectoryRequest { log_dir })
                    .await
                    .context("archiving the log directory")?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

/// Removes the state directory on every agent host. The hub's own state
/// directory is kept; it holds the archived status and configuration.
pub(crate) async fn delete_segment_state_dirs(
    config: &Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    conns
        .fan_out(&config.agent_hosts(), |_, mut client| async move {
            client
                .delete_state_directory(DeleteStateDirectoryRequest {})
                .await
                .context("deleting the state directory")?;
            Ok(())
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;
    use semver::Version;
    use uplift_cluster::Tablespaces;
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

    fn config() -> Config {
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
        let intermediate = crate::planner::plan(
            &source,
            &[],
            Utf8Path::new("/usr/local/gp6"),
            Version::new(6, 9, 0),
        )
        .unwrap();

        Config {
            upgrade_id: UpgradeId::from_raw(11),
            source,
            intermediate: Some(intermediate),
            target_gphome: Utf8PathBuf::from("/usr/local/gp6"),
            agent_port: 6416,
            use_link_mode: false,
            use_hba_hostnames: false,
            disk_free_ratio: 0.0,
            tablespaces: Tablespaces::new(),
            target_catalog_version: None,
            log_archive_dir: None,
        }
    }

    #[test]
    fn rename_pairs_exclude_the_hubs_host_and_swap_both_directions() {
        let pairs = rename_pairs(&config()).unwrap();

        assert!(!pairs.contains_key("mdw"));
        assert_eq!(pairs.len(), 3);

        let sdw1 = &pairs["sdw1"];
        assert_eq!(sdw1.len(), 2);
        assert_eq!(sdw1[0].source, "/data/p/seg0");
        assert_eq!(sdw1[0].target, "/data/p_upgrade/seg0");
        assert!(sdw1[0].rename_target);
        assert_eq!(sdw1[1].source, "/data/m/seg1");
        assert_eq!(sdw1[1].target, "/data/m_upgrade/seg1");

        assert_eq!(pairs["smdw"][0].source, "/data/standby");
        assert_eq!(pairs["smdw"][0].target, "/data_upgrade/standby");
    }

    #[test]
    fn conf_edits_restore_source_ports_on_primaries_and_mirrors() {
        let edits = conf_edits_for_host(&config(), "sdw1").unwrap();

        // One port edit per segment, plus the conninfo edit for the mirror.
        assert_eq!(edits.len(), 3);
        assert_eq!(edits[0].path, "/data/p/seg0/postgresql.conf");
        assert!(edits[0].pattern.contains("50434"));
        assert!(edits[0].replacement.contains("6000"));

        assert_eq!(edits[1].path, "/data/m/seg1/postgresql.conf");
        assert!(edits[1].pattern.contains("50435"));
        assert!(edits[1].replacement.contains("7000"));

        // The mirror's conninfo points at its primary, which lives on sdw2.
        assert_eq!(edits[2].path, "/data/m/seg1/recovery.conf");
        assert!(edits[2].pattern.contains("primary_conninfo"));
        assert!(edits[2].pattern.contains("50434"));
        assert!(edits[2].replacement.contains("6000"));
    }

    #[test]
    fn the_standby_gets_a_conninfo_edit_against_the_coordinator() {
        let edits = conf_edits_for_host(&config(), "smdw").unwrap();

        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].path, "/data/standby/postgresql.conf");
        assert_eq!(edits[1].path, "/data/standby/recovery.conf");
        assert!(edits[1].pattern.contains("50432"));
        assert!(edits[1].replacement.contains("5432"));
    }

    #[test]
    fn a_gp7_target_edits_the_auto_conf_instead() {
        let mut config = config();
        let intermediate = crate::planner::plan(
            &config.source,
            &[],
            Utf8Path::new("/usr/local/gp7"),
            Version::new(7, 1, 0),
        )
        .unwrap();
        config.intermediate = Some(intermediate);

        let edits = conf_edits_for_host(&config, "sdw1").unwrap();
        assert_eq!(edits[2].path, "/data/m/seg1/postgresql.auto.conf");
    }

    #[test]
    fn coordinator_edits_only_touch_gpperfmon_when_present() {
        let config = config();
        let edits = coordinator_conf_edits(&config).unwrap();

        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].path, "/data/qd/seg-1/postgresql.conf");
        assert!(edits[0].pattern.contains("50432"));
        assert!(edits[0].replacement.contains("5432"));
    }
}
