// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use uplift_system::fs::path_exists;
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;

use crate::segment::{Role, Segment};
use crate::tools;

#[derive(Debug, thiserror::Error)]
pub enum InvalidSegmentsError {
    #[error("invalid segment configuration ({segment:?}): {reason}")]
    Segment { segment: Box<Segment>, reason: String },
    #[error("invalid segment configuration: cluster has no coordinator")]
    NoCoordinator,
}

fn invalid(segment: &Segment, reason: impl Into<String>) -> InvalidSegmentsError {
    InvalidSegmentsError::Segment {
        segment: Box::new(segment.clone()),
        reason: reason.into(),
    }
}

/// One cluster's topology plus the installation it runs from. Immutable
/// after construction; the upgrade derives new clusters rather than
/// mutating loaded ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Primaries keyed by content id. The coordinator is content -1.
    primaries: BTreeMap<i32, Segment>,
    /// Mirrors keyed by content id. The standby is content -1. Not every
    /// primary is guaranteed a mirror.
    mirrors: BTreeMap<i32, Segment>,
    pub gphome: Utf8PathBuf,
    pub version: semver::Version,
}

impl Cluster {
    /// Builds a cluster from catalog rows, enforcing the topology
    /// invariants everything downstream relies on.
    pub fn new(
        segments: Vec<Segment>,
        gphome: impl AsRef<Utf8Path>,
        version: semver::Version,
    ) -> Result<Self, InvalidSegmentsError> {
        let mut primaries = BTreeMap::new();
        let mut mirrors = BTreeMap::new();
        let mut dbids = BTreeSet::new();

        for segment in segments {
            if segment.dbid <= 0 {
                return Err(invalid(&segment, format!("dbid {} is not positive", segment.dbid)));
            }
            if !dbids.insert(segment.dbid) {
                return Err(invalid(&segment, format!("duplicate dbid {}", segment.dbid)));
            }
            if segment.hostname.is_empty() {
                return Err(invalid(&segment, "empty hostname"));
            }
            if !(1..=65535).contains(&segment.port) {
                return Err(invalid(&segment, format!("port {} out of range", segment.port)));
            }

            let (bucket, kind) = match segment.role {
                Role::Primary => (&mut primaries, "primaries"),
                Role::Mirror => (&mut mirrors, "mirrors"),
            };
            let content = segment.content;
            if let Some(previous) = bucket.insert(content, segment) {
                return Err(invalid(
                    &previous,
                    format!("multiple {kind} with content ID {content}"),
                ));
            }
        }

        if !primaries.contains_key(&-1) {
            return Err(InvalidSegmentsError::NoCoordinator);
        }

        for mirror in mirrors.values() {
            if !primaries.contains_key(&mirror.content) {
                return Err(invalid(
                    mirror,
                    format!("mirror with content ID {} has no primary", mirror.content),
                ));
            }
        }

        Ok(Cluster {
            primaries,
            mirrors,
            gphome: gphome.as_ref().to_owned(),
            version,
        })
    }

    /// Loads the topology from a running coordinator. The installation path
    /// must be supplied; it cannot be divined from the catalog.
    pub async fn from_db(
        client: &tokio_postgres::Client,
        gphome: impl AsRef<Utf8Path>,
        version: semver::Version,
    ) -> anyhow::Result<Self> {
        // 5X keeps data directories in the filespace catalog.
        let query = if version.major < 6 {
            "SELECT s.dbid::int, s.content::int, s.port::int, s.hostname, \
                    e.fselocation as datadir, s.role::text \
             FROM gp_segment_configuration s \
             JOIN pg_filespace_entry e ON s.dbid = e.fsedbid \
             JOIN pg_filespace f ON e.fsefsoid = f.oid \
             WHERE f.fsname = 'pg_system' \
             ORDER BY s.content"
        } else {
            "SELECT dbid::int, content::int, port::int, hostname, datadir, role::text \
             FROM gp_segment_configuration \
             ORDER BY content"
        };

        let rows = client
            .query(query, &[])
            .await
            .context("retrieving segment configuration")?;

        let mut segments = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row.try_get("role").context("decoding segment row")?;
            let role = match role.as_str() {
                "p" => Role::Primary,
                "m" => Role::Mirror,
                other => anyhow::bail!("unknown segment role {other:?}"),
            };
            let data_dir: String = row.try_get("datadir").context("decoding segment row")?;
            segments.push(Segment {
                dbid: row.try_get("dbid").context("decoding segment row")?,
                content: row.try_get("content").context("decoding segment row")?,
                port: row.try_get("port").context("decoding segment row")?,
                hostname: row.try_get("hostname").context("decoding segment row")?,
                data_dir: Utf8PathBuf::from(data_dir),
                role,
            });
        }

        Ok(Cluster::new(segments, gphome, version)?)
    }

    pub fn coordinator(&self) -> &Segment {
        // Presence is a construction invariant.
        &self.primaries[&-1]
    }

    pub fn coordinator_data_dir(&self) -> &Utf8Path {
        &self.coordinator().data_dir
    }

    pub fn coordinator_port(&self) -> i32 {
        self.coordinator().port
    }

    pub fn coordinator_hostname(&self) -> &str {
        &self.coordinator().hostname
    }

    pub fn standby(&self) -> Option<&Segment> {
        self.mirrors.get(&-1)
    }

    pub fn has_standby(&self) -> bool {
        self.standby().is_some()
    }

    /// True when at least one non-standby mirror exists.
    pub fn has_mirrors(&self) -> bool {
        self.mirrors.keys().any(|content| *content != -1)
    }

    /// True when every primary, the coordinator included, has a mirror.
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.primaries
            .keys()
            .all(|content| self.mirrors.contains_key(content))
    }

    pub fn contents(&self) -> impl Iterator<Item = i32> + '_ {
        self.primaries.keys().copied()
    }

    pub fn primary_for_content(&self, content: i32) -> Option<&Segment> {
        self.primaries.get(&content)
    }

    pub fn mirror_for_content(&self, content: i32) -> Option<&Segment> {
        self.mirrors.get(&content)
    }

    /// All segments matching the selector, in ascending content order with
    /// each primary before its mirror.
    pub fn select(&self, mut selector: impl FnMut(&Segment) -> bool) -> Vec<&Segment> {
        let mut matches = Vec::new();
        for (content, primary) in &self.primaries {
            if selector(primary) {
                matches.push(primary);
            }
            if let Some(mirror) = self.mirrors.get(content) {
                if selector(mirror) {
                    matches.push(mirror);
                }
            }
        }
        matches
    }

    pub fn primaries(&self) -> impl Iterator<Item = &Segment> {
        self.primaries.values()
    }

    pub fn mirrors(&self) -> impl Iterator<Item = &Segment> {
        self.mirrors.values()
    }

    pub fn segments_on(&self, hostname: &str) -> Vec<&Segment> {
        self.select(|segment| segment.is_on_host(hostname))
    }

    /// Distinct hostnames carrying a non-coordinator primary, sorted. These
    /// are the hosts that run agents.
    pub fn primary_hostnames(&self) -> Vec<String> {
        let hosts: BTreeSet<_> = self
            .primaries
            .values()
            .filter(|segment| segment.content >= 0)
            .map(|segment| segment.hostname.clone())
            .collect();
        hosts.into_iter().collect()
    }

    /// Every distinct hostname in the cluster, coordinator included, sorted.
    pub fn hostnames(&self) -> Vec<String> {
        let hosts: BTreeSet<_> = self
            .primaries
            .values()
            .chain(self.mirrors.values())
            .map(|segment| segment.hostname.clone())
            .collect();
        hosts.into_iter().collect()
    }

    pub async fn start(
        &self,
        runner: &dyn CommandRunner,
        streams: &dyn OutStreams,
    ) -> anyhow::Result<()> {
        runner
            .run(
                tools::gpstart(&self.gphome, self.coordinator_data_dir(), false),
                streams,
            )
            .await
            .context("starting cluster")
    }

    pub async fn stop(
        &self,
        runner: &dyn CommandRunner,
        streams: &dyn OutStreams,
    ) -> anyhow::Result<()> {
        if !self.is_coordinator_running(runner, streams).await? {
            anyhow::bail!("coordinator is already stopped");
        }
        runner
            .run(
                tools::gpstop(&self.gphome, self.coordinator_data_dir(), false),
                streams,
            )
            .await
            .context("stopping cluster")
    }

    /// Starts only the coordinator, in utility-capable mode, for catalog
    /// surgery.
    pub async fn start_coordinator_only(
        &self,
        runner: &dyn CommandRunner,
        streams: &dyn OutStreams,
    ) -> anyhow::Result<()> {
        runner
            .run(
                tools::gpstart(&self.gphome, self.coordinator_data_dir(), true),
                streams,
            )
            .await
            .context("starting coordinator")
    }

    pub async fn stop_coordinator_only(
        &self,
        runner: &dyn CommandRunner,
        streams: &dyn OutStreams,
    ) -> anyhow::Result<()> {
        if !self.is_coordinator_running(runner, streams).await? {
            anyhow::bail!("coordinator is already stopped");
        }
        runner
            .run(
                tools::gpstop(&self.gphome, self.coordinator_data_dir(), true),
                streams,
            )
            .await
            .context("stopping coordinator")
    }

    /// Whether the coordinator postmaster is alive, judged by its pid file.
    pub async fn is_coordinator_running(
        &self,
        runner: &dyn CommandRunner,
        streams: &dyn OutStreams,
    ) -> anyhow::Result<bool> {
        let pidfile = self.coordinator_data_dir().join("postmaster.pid");
        if !path_exists(&pidfile) {
            return Ok(false);
        }

        let out = runner
            .capture(tools::pgrep_pidfile(&pidfile))
            .await
            .context("checking for postmaster process")?;

        use std::io::Write;
        let _ = streams.stdout().write_all(out.stdout.as_bytes());
        let _ = streams.stderr().write_all(out.stderr.as_bytes());

        if out.success() {
            return Ok(true);
        }
        // pgrep exits 1 when no process matched.
        if out.status.code() == Some(1) {
            return Ok(false);
        }
        anyhow::bail!("checking for postmaster process: {}", out.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(dbid: i32, content: i32, port: i32, host: &str, dir: &str, role: Role) -> Segment {
        Segment {
            dbid,
            content,
            port,
            hostname: host.into(),
            data_dir: dir.into(),
            role,
        }
    }

    fn version() -> semver::Version {
        semver::Version::new(6, 9, 0)
    }

    fn three_node() -> Cluster {
        Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
                seg(3, 1, 6000, "sdw2", "/data/p/seg1", Role::Primary),
                seg(4, 0, 7000, "sdw2", "/data/m/seg0", Role::Mirror),
                seg(5, 1, 7000, "sdw1", "/data/m/seg1", Role::Mirror),
            ],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap()
    }

    #[test]
    fn selectors_reflect_topology() {
        let cluster = three_node();

        assert_eq!(cluster.coordinator().hostname, "mdw");
        assert_eq!(cluster.coordinator_port(), 5432);
        assert!(!cluster.has_standby());
        assert!(cluster.has_mirrors());
        assert!(!cluster.has_all_mirrors_and_standby());
        assert_eq!(cluster.primary_hostnames(), vec!["sdw1", "sdw2"]);
        assert_eq!(cluster.hostnames(), vec!["mdw", "sdw1", "sdw2"]);
    }

    #[test]
    fn select_orders_primaries_before_mirrors_by_content() {
        let cluster = three_node();
        let on_sdw1: Vec<_> = cluster
            .segments_on("sdw1")
            .into_iter()
            .map(|segment| (segment.content, segment.role))
            .collect();

        assert_eq!(on_sdw1, vec![(0, Role::Primary), (1, Role::Mirror)]);
    }

    #[test]
    fn coordinator_only_cluster_is_valid() {
        let cluster = Cluster::new(
            vec![seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary)],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap();

        assert!(cluster.primary_hostnames().is_empty());
        assert!(!cluster.has_mirrors());
    }

    #[test]
    fn missing_coordinator_is_rejected() {
        let err = Cluster::new(
            vec![seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary)],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();

        assert!(matches!(err, InvalidSegmentsError::NoCoordinator));
    }

    #[test]
    fn duplicate_content_and_dbid_are_rejected() {
        let err = Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
                seg(3, 0, 6001, "sdw1", "/data/p/seg0b", Role::Primary),
            ],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple primaries"));

        let err = Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(1, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
            ],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate dbid"));
    }

    #[test]
    fn orphan_mirror_is_rejected() {
        let err = Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(4, 2, 7000, "sdw2", "/data/m/seg2", Role::Mirror),
            ],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();

        assert!(err.to_string().contains("has no primary"));
    }

    #[test]
    fn bad_ports_and_hostnames_are_rejected() {
        let err = Cluster::new(
            vec![seg(1, -1, 0, "mdw", "/data/qd/seg-1", Role::Primary)],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("port 0 out of range"));

        let err = Cluster::new(
            vec![seg(1, -1, 5432, "", "/data/qd/seg-1", Role::Primary)],
            "/usr/local/greenplum-db",
            version(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty hostname"));
    }

    #[test]
    fn serialization_round_trips() {
        let cluster = three_node();
        let json = serde_json::to_string_pretty(&cluster).unwrap();
        let back: Cluster = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cluster);
    }
}
