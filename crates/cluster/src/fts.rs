// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Waiting for fault-tolerance service agreement that every mirror is up
//! and synchronized, after mirrors are created or recovered.

use std::time::Duration;

use anyhow::Context;
use tokio::time::{sleep, Instant};

pub const MIRROR_SYNC_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polls until `poll` reports every mirror up and synchronized, once per
/// second. The deadline is checked before each poll, so a zero timeout
/// never polls and fails immediately.
pub async fn wait_for_mirrors<F, Fut>(timeout: Duration, mut poll: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            anyhow::bail!(
                "{} timeout exceeded waiting for mirrors to be up and synchronized",
                humantime::format_duration(timeout)
            );
        }

        if poll().await? {
            return Ok(());
        }

        sleep(POLL_INTERVAL).await;
    }
}

/// One synchronization probe against a running coordinator: kick the fault
/// tolerance scan, then check that every mirror row is up and in sync.
pub async fn mirrors_synchronized(client: &tokio_postgres::Client) -> anyhow::Result<bool> {
    client
        .query("SELECT gp_request_fts_probe_scan()", &[])
        .await
        .context("requesting gp_request_fts_probe_scan")?;

    let row = client
        .query_one(
            "SELECT every(status = 'u' AND mode = 's') \
             FROM gp_segment_configuration WHERE role = 'm'",
            &[],
        )
        .await
        .context("querying gp_segment_configuration")?;

    // every() over zero rows is NULL; with no mirror rows there is nothing
    // to wait for yet.
    let synced: Option<bool> = row.get(0);
    Ok(synced.unwrap_or(false))
}
