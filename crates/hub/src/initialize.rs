// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The initialize phase: snapshots the source topology, plans the
//! intermediate cluster, initializes it on temporary ports, and finishes
//! with a dry run of the page-format checks while everything is stopped.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use semver::Version;

use uplift_cluster::connection::ConnectionOptions;
use uplift_cluster::{tablespaces, tools, version, Cluster, Tablespaces};
use uplift_protocol::agent::{
    CheckDiskSpaceRequest, CreateSegmentDataDirectoriesRequest, FilesystemUsage,
};
use uplift_protocol::common::{Message, Phase, Substep};
use uplift_step::{MessageSender, Skip, Step};
use uplift_system::runner::{CommandRunner, Invocation};
use uplift_system::streams::OutStreams;
use uplift_system::{disk, fs, paths};
use uplift_types::{ErrorList, NextActionError, UpgradeId};

use crate::agents::{self, AgentConns};
use crate::config::Config;
use crate::{coordinator, execute, planner};

/// Operator-supplied knobs, taken once at initialize time and persisted in
/// the configuration for every later phase.
#[derive(Debug, Clone)]
pub struct InitializeOptions {
    pub source_gphome: Utf8PathBuf,
    pub source_port: i32,
    pub target_gphome: Utf8PathBuf,
    /// Temporary ports for the intermediate cluster. Empty means the
    /// planner's default pool.
    pub temp_port_range: Vec<u32>,
    pub agent_port: u16,
    pub use_link_mode: bool,
    pub use_hba_hostnames: bool,
    pub disk_free_ratio: f64,
}

pub async fn run(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    sender: Arc<dyn MessageSender>,
    options: InitializeOptions,
) -> anyhow::Result<()> {
    paths::ensure_state_dir(state_dir)?;

    let mut step = Step::begin(state_dir, Phase::Initialize, Arc::clone(&sender))?;

    step.run(Substep::SaveSourceClusterConfig, |_| {
        let options = &options;
        async move { save_source_cluster_config(runner, state_dir, options).await }
    })
    .await;

    // Every remaining substep works from the persisted configuration, so a
    // hub restart between substeps changes nothing.
    let mut config = match Config::load(state_dir) {
        Ok(config) => config,
        Err(err) => return ErrorList::combine(Err(err), step.finish()),
    };
    let conns = AgentConns::new(config.agent_port);

    step.run(Substep::StartAgents, |streams| {
        let config = &config;
        let conns = &conns;
        async move {
            let agent_path = agents::agent_binary_path()?;
            agents::ensure_versions_match(runner, &agent_path, &config.agent_hosts()).await?;
            let started =
                agents::restart_agents(runner, conns, &agent_path, &config.agent_hosts()).await?;
            writeln!(streams.stdout(), "Agents started on: {}", started.join(", "))
                .context("reporting started agents")?;
            Ok(())
        }
    })
    .await;

    step.run(Substep::CheckDiskSpace, |_| {
        let config = &config;
        let conns = &conns;
        async move {
            if config.disk_free_ratio == 0.0 {
                return Err(Skip.into());
            }
            check_disk_space(conns, config).await
        }
    })
    .await;

    step.run(Substep::GenerateIntermediateConfig, |_| {
        let config = &mut config;
        let options = &options;
        async move {
            generate_intermediate_config(runner, state_dir, config, options).await
        }
    })
    .await;

    step.run(Substep::StopSourceCluster, |streams| {
        let config = &config;
        async move {
            if !config
                .source
                .is_coordinator_running(runner, streams.as_ref())
                .await?
            {
                return Err(Skip.into());
            }
            config.source.stop(runner, streams.as_ref()).await
        }
    })
    .await;

    step.run(Substep::InitIntermediateCluster, |streams| {
        let config = &mut config;
        let conns = &conns;
        async move {
            init_intermediate_cluster(runner, streams.as_ref(), state_dir, config, conns).await
        }
    })
    .await;

    step.run(Substep::StopIntermediateCluster, |streams| {
        let config = &config;
        async move {
            let intermediate = config.intermediate()?;
            intermediate.stop(runner, streams.as_ref()).await?;
            coordinator::backup(runner, streams.as_ref(), state_dir, intermediate).await
        }
    })
    .await;

    // Always rerun the checks; the source may have changed since the last
    // invocation.
    step.always_run(Substep::CheckUpgrade, |streams| {
        let config = &config;
        let conns = &conns;
        async move {
            let (coordinator, primaries) = tokio::join!(
                coordinator::upgrade(runner, streams.as_ref(), state_dir, config, true),
                execute::upgrade_primaries(conns, state_dir, config, true),
            );
            ErrorList::combine(coordinator, primaries)
        }
    })
    .await;

    step.finish()?;

    let mut data = HashMap::new();
    data.insert(
        "has-mirrors".to_string(),
        config.source.has_mirrors().to_string(),
    );
    data.insert(
        "has-standby".to_string(),
        config.source.has_standby().to_string(),
    );
    sender.send(Message::response(data))
}

/// Loads the source topology and, for a 5X source, its tablespaces, then
/// persists the initial configuration.
async fn save_source_cluster_config(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    options: &InitializeOptions,
) -> anyhow::Result<()> {
    let source_version = version::local_version(runner, &options.source_gphome).await?;
    let client = ConnectionOptions::new(options.source_port, source_version.clone())
        .connect()
        .await?;
    let source = Cluster::from_db(&client, &options.source_gphome, source_version.clone()).await?;

    // 6X and later let pg_upgrade discover tablespaces itself; 5X needs the
    // mapping file written while the source catalog is still reachable.
    let tablespaces = if source_version.major < 6 {
        let tuples = tablespaces::query_tuples(&client).await?;
        let dir = paths::tablespaces_dir(state_dir);
        std::fs::create_dir_all(dir.as_std_path())
            .with_context(|| format!("creating {dir}"))?;
        fs::atomic_write(
            &paths::tablespaces_mapping_path(state_dir),
            tablespaces::render_mapping_file(&tuples).as_bytes(),
        )?;
        tablespaces::from_tuples(&tuples)
    } else {
        Tablespaces::new()
    };

    let config = Config {
        upgrade_id: UpgradeId::random(),
        source,
        intermediate: None,
        target_gphome: options.target_gphome.clone(),
        agent_port: options.agent_port,
        use_link_mode: options.use_link_mode,
        use_hba_hostnames: options.use_hba_hostnames,
        disk_free_ratio: options.disk_free_ratio,
        tablespaces,
        target_catalog_version: None,
        log_archive_dir: None,
    };
    config.save(state_dir)
}

async fn check_disk_space(conns: &AgentConns, config: &Config) -> anyhow::Result<()> {
    let coordinator_host = config.source.coordinator_hostname();
    let local_dirs: Vec<Utf8PathBuf> = config
        .source
        .segments_on(coordinator_host)
        .iter()
        .map(|segment| segment.data_dir.clone())
        .collect();

    let mut failed: Vec<FilesystemUsage> = disk::check_usage(config.disk_free_ratio, &local_dirs)?
        .into_iter()
        .map(|usage| FilesystemUsage {
            fs: usage.fs.to_string(),
            host: usage.host,
            available: usage.available_bytes,
            required: usage.required_bytes,
        })
        .collect();

    let replies = conns
        .fan_out(&config.agent_hosts(), |host, mut client| {
            let datadirs: Vec<String> = config
                .source
                .segments_on(&host)
                .iter()
                .map(|segment| segment.data_dir.to_string())
                .collect();
            let free_ratio = config.disk_free_ratio;
            async move {
                let reply = client
                    .check_disk_space(CheckDiskSpaceRequest { free_ratio, datadirs })
                    .await?;
                Ok(reply.into_inner().failed)
            }
        })
        .await?;
    failed.extend(replies.into_iter().flatten());

    if failed.is_empty() {
        return Ok(());
    }

    let err = anyhow::anyhow!(
        "not enough free disk space:\n{}",
        render_shortfalls(&mut failed)
    );
    Err(NextActionError::new(
        err,
        "Free additional disk space on the listed filesystems, or re-run \
         \"uplift initialize\" with a lower --disk-free-ratio.",
    )
    .into())
}

fn render_shortfalls(failed: &mut [FilesystemUsage]) -> String {
    failed.sort_by(|a, b| (&a.host, &a.fs).cmp(&(&b.host, &b.fs)));
    failed
        .iter()
        .map(|usage| {
            format!(
                "{} ({}): {} bytes available, {} bytes required",
                usage.fs, usage.host, usage.available, usage.required
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Plans the intermediate cluster and renders its gpinitsystem input. Runs
/// while the source is still up so its settings can be queried.
async fn generate_intermediate_config(
    runner: &dyn CommandRunner,
    state_dir: &Utf8PathBuf,
    config: &mut Config,
    options: &InitializeOptions,
) -> anyhow::Result<()> {
    let target_version = version::local_version(runner, &config.target_gphome).await?;
    let intermediate = planner::plan(
        &config.source,
        &options.temp_port_range,
        &config.target_gphome,
        target_version,
    )?;

    let client = ConnectionOptions::new(
        config.source.coordinator_port(),
        config.source.version.clone(),
    )
    .connect()
    .await?;
    let settings = cluster_settings(&client, &config.source.version).await?;

    let rendered = render_initsystem_config(&intermediate, &settings, config.use_hba_hostnames)?;
    fs::atomic_write(
        &paths::initsystem_config_path(state_dir),
        rendered.as_bytes(),
    )?;

    config.intermediate = Some(intermediate);
    config.save(state_dir)
}

/// Source settings the intermediate cluster must be initialized with.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterSettings {
    /// Gone in 7; carried over for everything older.
    checkpoint_segments: Option<String>,
    encoding: String,
}

async fn cluster_settings(
    client: &tokio_postgres::Client,
    source_version: &Version,
) -> anyhow::Result<ClusterSettings> {
    let encoding: String = client
        .query_one("SELECT current_setting('server_encoding')", &[])
        .await
        .context("retrieving server_encoding")?
        .try_get(0)?;

    let checkpoint_segments = if source_version.major < 7 {
        let value: String = client
            .query_one("SELECT current_setting('checkpoint_segments')", &[])
            .await
            .context("retrieving checkpoint_segments")?
            .try_get(0)?;
        Some(value)
    } else {
        None
    };

    Ok(ClusterSettings {
        checkpoint_segments,
        encoding,
    })
}

/// The common prefix of the segment directory names, which gpinitsystem
/// insists on deriving directory names from.
fn seg_prefix(intermediate: &Cluster) -> anyhow::Result<String> {
    let base = intermediate
        .coordinator_data_dir()
        .file_name()
        .unwrap_or_default();
    base.strip_suffix("-1")
        .map(str::to_owned)
        .with_context(|| format!("coordinator directory {base:?} does not end in -1"))
}

fn array_entry(segment: &uplift_cluster::Segment) -> String {
    format!(
        "{}~{}~{}~{}~{}",
        segment.hostname, segment.port, segment.data_dir, segment.dbid, segment.content
    )
}

fn render_initsystem_config(
    intermediate: &Cluster,
    settings: &ClusterSettings,
    use_hba_hostnames: bool,
) -> anyhow::Result<String> {
    let mut out = String::new();
    out.push_str("ARRAY_NAME=\"uplift intermediate cluster\"\n");
    out.push_str(&format!("SEG_PREFIX={}\n", seg_prefix(intermediate)?));
    out.push_str("TRUSTED_SHELL=ssh\n");
    if use_hba_hostnames {
        out.push_str("HBA_HOSTNAMES=1\n");
    }
    if let Some(checkpoint_segments) = &settings.checkpoint_segments {
        out.push_str(&format!("CHECK_POINT_SEGMENTS={checkpoint_segments}\n"));
    }
    out.push_str(&format!("ENCODING={}\n", settings.encoding));
    out.push_str(&format!(
        "QD_PRIMARY_ARRAY={}\n",
        array_entry(intermediate.coordinator())
    ));

    out.push_str("declare -a PRIMARY_ARRAY=(\n");
    for primary in intermediate.primaries().filter(|segment| segment.content >= 0) {
        out.push_str(&format!("\t{}\n", array_entry(primary)));
    }
    out.push_str(")\n");
    Ok(out)
}

async fn init_intermediate_cluster(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    state_dir: &Utf8PathBuf,
    config: &mut Config,
    conns: &AgentConns,
) -> anyhow::Result<()> {
    let intermediate = config.intermediate()?;

    fs::create_data_directory(intermediate.coordinator_data_dir())?;
    conns
        .fan_out(&config.agent_hosts(), |host, mut client| {
            let datadirs: Vec<String> = intermediate
                .primaries()
                .filter(|segment| segment.content >= 0 && segment.is_on_host(&host))
                .map(|segment| segment.data_dir.to_string())
                .collect();
            async move {
                client
                    .create_segment_data_directories(CreateSegmentDataDirectoriesRequest {
                        datadirs,
                    })
                    .await?;
                Ok(())
            }
        })
        .await?;

    let init = tools::gpinitsystem(
        &intermediate.gphome,
        &paths::initsystem_config_path(state_dir),
        intermediate.version.major < 7,
    );
    runner.run(init, streams).await.map_err(|err| {
        let err = anyhow::Error::new(err).context("initializing the intermediate cluster");
        anyhow::Error::new(NextActionError::new(
            err,
            format!(
                "Review the gpinitsystem output in the initialize log under {} \
                 and re-run \"uplift initialize\".",
                paths::log_dir()
            ),
        ))
    })?;

    let catalog_version = catalog_version(runner, intermediate).await?;
    config.target_catalog_version = Some(catalog_version);
    config.save(state_dir)
}

/// The target's on-disk catalog version, which tablespace paths embed.
async fn catalog_version(
    runner: &dyn CommandRunner,
    intermediate: &Cluster,
) -> anyhow::Result<String> {
    let invocation = Invocation::new(intermediate.gphome.join("bin").join("pg_controldata").as_str())
        .arg(intermediate.coordinator_data_dir().as_str());

    let out = runner
        .capture(invocation)
        .await
        .context("running pg_controldata")?;
    if !out.success() {
        anyhow::bail!("pg_controldata failed with {}: {}", out.status, out.stderr.trim());
    }
    parse_catalog_version(&out.stdout)
}

fn parse_catalog_version(raw: &str) -> anyhow::Result<String> {
    raw.lines()
        .find_map(|line| line.strip_prefix("Catalog version number:"))
        .map(|rest| rest.trim().to_string())
        .context("no catalog version in pg_controldata output")
}
