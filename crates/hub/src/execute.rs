// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The execute phase: runs the page-format upgrade against the coordinator,
//! ships the result to the segment hosts, upgrades every primary in place,
//! and brings the intermediate cluster up.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;

use uplift_cluster::Cluster;
use uplift_protocol::agent::{DataDirPair, TablespaceInfo, UpgradePrimariesRequest};
use uplift_protocol::common::{Message, Phase, Substep};
use uplift_step::{MessageSender, Step};
use uplift_system::paths;
use uplift_system::runner::CommandRunner;

use crate::agents::AgentConns;
use crate::config::Config;
use crate::coordinator;

pub async fn run(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    sender: Arc<dyn MessageSender>,
) -> anyhow::Result<()> {
    let config = Config::load(state_dir)?;
    let conns = AgentConns::new(config.agent_port);

    let mut step = Step::begin(state_dir, Phase::Execute, Arc::clone(&sender))?;

    step.run(Substep::UpgradeCoordinator, |streams| {
        let config = &config;
        async move {
            coordinator::upgrade(runner, streams.as_ref(), state_dir, config, false).await
        }
    })
    .await;

    step.run(Substep::CopyCoordinatorToSegments, |streams| {
        let config = &config;
        async move {
            coordinator::copy_to_segments(runner, streams.as_ref(), state_dir, config).await
        }
    })
    .await;

    step.run(Substep::UpgradePrimaries, |_| {
        let config = &config;
        let conns = &conns;
        async move { upgrade_primaries(conns, state_dir, config, false).await }
    })
    .await;

    step.run(Substep::StartTargetCluster, |streams| {
        let config = &config;
        async move { config.intermediate()?.start(runner, streams.as_ref()).await }
    })
    .await;

    step.finish()?;

    let intermediate = config.intermediate()?;
    let mut data = HashMap::new();
    data.insert("port".to_string(), intermediate.coordinator_port().to_string());
    data.insert(
        "coordinator-datadir".to_string(),
        intermediate.coordinator_data_dir().to_string(),
    );
    sender.send(Message::response(data))
}

/// Fans the per-host primary upgrades out to the agents. Also used by
/// initialize's final check, with `check_only` set.
pub(crate) async fn upgrade_primaries(
    conns: &AgentConns,
    state_dir: &Utf8PathBuf,
    config: &Config,
    check_only: bool,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;
    let hosts = config.source.primary_hostnames();

    // The state directory layout is mirrored across hosts, so our mapping
    // path is also theirs.
    let mapping = if config.tablespaces.is_empty() {
        String::new()
    } else {
        paths::tablespaces_mapping_path(state_dir).into_string()
    };
    let backup = coordinator::segment_backup_dir(state_dir).into_string();

    conns
        .fan_out(&hosts, |host, mut client| {
            let mapping = mapping.clone();
            let backup = backup.clone();
            async move {
                let request = UpgradePrimariesRequest {
                    source_bindir: config.source.gphome.join("bin").into_string(),
                    target_bindir: intermediate.gphome.join("bin").into_string(),
                    target_version: intermediate.version.to_string(),
                    check_only,
                    use_link_mode: config.use_link_mode,
                    tablespaces_mapping_file_path: mapping,
                    coordinator_backup_dir: backup,
                    data_dir_pairs: data_dir_pairs(config, intermediate, &host)?,
                };
                client.upgrade_primaries(request).await?;
                Ok(())
            }
        })
        .await?;
    Ok(())
}

/// The source/target segment pairs one host is responsible for, in content
/// order.
pub(crate) fn data_dir_pairs(
    config: &Config,
    intermediate: &Cluster,
    host: &str,
) -> anyhow::Result<Vec<DataDirPair>> {
    let mut pairs = Vec::new();
    for source in config.source.primaries() {
        if source.content == -1 || !source.is_on_host(host) {
            continue;
        }
        let target = intermediate
            .primary_for_content(source.content)
            .with_context(|| format!("no planned primary for content {}", source.content))?;

        pairs.push(DataDirPair {
            source_data_dir: source.data_dir.to_string(),
            target_data_dir: target.data_dir.to_string(),
            source_port: source.port,
            target_port: target.port,
            content: source.content,
            dbid: source.dbid,
            tablespaces: segment_tablespaces(config, source.dbid),
        });
    }
    Ok(pairs)
}

fn segment_tablespaces(config: &Config, dbid: i32) -> Vec<TablespaceInfo> {
    config
        .tablespaces
        .for_dbid(dbid)
        .into_iter()
        .flat_map(|spaces| spaces.iter())
        .map(|(oid, info)| TablespaceInfo {
            oid: *oid,
            location: info.location.to_string(),
            user_defined: info.user_defined,
        })
        .collect()
}
