// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Plans the intermediate cluster: the source topology on temporary ports
//! and `_upgrade` data directories. Ports come from an operator-supplied
//! pool, or a default range when none is given, and are reused across hosts
//! so a pool sized for the busiest host serves the whole cluster.

use std::collections::HashMap;

use camino::Utf8Path;
use semver::Version;

use uplift_cluster::{Cluster, Segment};
use uplift_system::fs;

const DEFAULT_POOL_START: i32 = 50432;
const MAX_PORT: i32 = 65535;

#[derive(Debug, thiserror::Error)]
#[error("not enough ports")]
pub struct NotEnoughPorts;

/// Sorts ascending and drops duplicates. Idempotent, so a pool that has
/// already been sanitized passes through unchanged.
pub fn sanitize_ports(ports: &[u32]) -> Vec<i32> {
    let mut ports: Vec<i32> = ports
        .iter()
        .filter(|port| **port <= MAX_PORT as u32)
        .map(|port| *port as i32)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

// Sized for every primary and mirror plus the coordinator/standby
// reservations, whether or not a standby exists.
fn default_pool(source: &Cluster) -> Vec<i32> {
    let count = source.select(|segment| segment.content != -1).len() as i32 + 2;
    (DEFAULT_POOL_START..=MAX_PORT.min(DEFAULT_POOL_START + count - 1)).collect()
}

pub fn plan(
    source: &Cluster,
    ports: &[u32],
    target_gphome: &Utf8Path,
    target_version: Version,
) -> anyhow::Result<Cluster> {
    let pool = if ports.is_empty() {
        default_pool(source)
    } else {
        sanitize_ports(ports)
    };
    let segments = assign(source, &pool)?;
    Cluster::new(segments, target_gphome, target_version).map_err(Into::into)
}

/// The coordinator takes the first port and the standby the second. The
/// remaining segments share a per-host cursor into the pool: segments on
/// one host get consecutive ports, while different hosts reuse the same
/// ports. Primaries are assigned before mirrors so a pool listed in
/// primary-then-mirror order lands where operators expect.
fn assign(source: &Cluster, pool: &[i32]) -> Result<Vec<Segment>, NotEnoughPorts> {
    let take = |index: usize| pool.get(index).copied().ok_or(NotEnoughPorts);

    let planned = |segment: &Segment, port: i32| {
        let mut planned = segment.clone();
        planned.port = port;
        planned.data_dir = fs::upgrade_data_dir(&segment.data_dir);
        planned
    };

    let mut segments = Vec::new();
    segments.push(planned(source.coordinator(), take(0)?));

    let mut base = 1;
    if let Some(standby) = source.standby() {
        segments.push(planned(standby, take(1)?));
        base = 2;
    }

    let mut cursor_by_host: HashMap<&str, usize> = HashMap::new();
    for segment in source.primaries().chain(source.mirrors()) {
        if segment.content == -1 {
            continue;
        }
        let index = cursor_by_host
            .get(segment.hostname.as_str())
            .copied()
            .unwrap_or(base);
        let port = take(index)?;
        cursor_by_host.insert(segment.hostname.as_str(), index + 1);
        segments.push(planned(segment, port));
    }
    Ok(segments)
}
