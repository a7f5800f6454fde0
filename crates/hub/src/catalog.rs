// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Direct surgery on gp_segment_configuration. Finalize runs these against
//! a coordinator started alone in utility mode with system table mods
//! allowed; nothing here is reachable while the cluster serves traffic.

use std::collections::BTreeSet;

use anyhow::Context;
use tokio_postgres::Client;

use uplift_cluster::{Cluster, Role, Segment};
use uplift_types::ErrorList;

const REPLICATION_SLOT: &str = "internal_wal_replication_slot";

/// Commits on success; rolls back on failure and reports both errors if the
/// rollback fails too.
async fn commit_or_rollback(client: &Client, result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Ok(()) => client
            .batch_execute("COMMIT")
            .await
            .context("committing transaction"),
        Err(err) => rollback_outcome(
            err,
            client
                .batch_execute("ROLLBACK")
                .await
                .context("rolling back transaction"),
        ),
    }
}

/// The original failure and a failed rollback must both survive; a clean
/// rollback leaves the original error unchanged.
fn rollback_outcome(err: anyhow::Error, rollback: anyhow::Result<()>) -> anyhow::Result<()> {
    ErrorList::combine(Err(err), rollback)
}

/// Rewrites every row's port and datadir to the final values, inside one
/// transaction. The rows must already describe exactly the expected
/// contents; a drifted catalog aborts before any row changes.
pub async fn update_segment_configuration(
    client: &Client,
    target: &Cluster,
) -> anyhow::Result<()> {
    client
        .batch_execute("BEGIN")
        .await
        .context("beginning transaction")?;
    let result = update_rows(client, target).await;
    commit_or_rollback(client, result).await
}

async fn update_rows(client: &Client, target: &Cluster) -> anyhow::Result<()> {
    let rows = client
        .query(
            "SELECT content::int FROM gp_segment_configuration WHERE role = 'p'",
            &[],
        )
        .await
        .context("querying catalog contents")?;
    let catalog: BTreeSet<i32> = rows.iter().map(|row| row.get(0)).collect();
    let expected: BTreeSet<i32> = target.contents().collect();
    verify_contents(&catalog, &expected)?;

    for segment in target.select(|_| true) {
        update_row(client, segment).await?;
    }
    Ok(())
}

/// A drifted catalog aborts the transaction before any row changes.
fn verify_contents(catalog: &BTreeSet<i32>, expected: &BTreeSet<i32>) -> anyhow::Result<()> {
    anyhow::ensure!(
        catalog == expected,
        "catalog primaries {catalog:?} do not match the expected contents {expected:?}"
    );
    Ok(())
}

/// The role is embedded as a literal; it only ever comes from [`Role::code`].
fn update_query(role: Role) -> String {
    format!(
        "UPDATE gp_segment_configuration SET port = $1::int, datadir = $2 \
         WHERE content = $3::int AND role = '{}'",
        role.code()
    )
}

async fn update_row(client: &Client, segment: &Segment) -> anyhow::Result<()> {
    let datadir = segment.data_dir.as_str();
    let updated = client
        .execute(
            &update_query(segment.role),
            &[&segment.port, &datadir, &segment.content],
        )
        .await
        .with_context(|| format!("updating segment with content {}", segment.content))?;
    verify_updated(updated, segment)
}

/// More than one affected row means an unexpected extra row for this
/// content and role; zero means the row is missing. Either aborts.
fn verify_updated(updated: u64, segment: &Segment) -> anyhow::Result<()> {
    anyhow::ensure!(
        updated == 1,
        "expected 1 catalog row for content {} role {}, updated {updated}",
        segment.content,
        segment.role.code()
    );
    Ok(())
}

const INSERT_MIRROR: &str = "INSERT INTO gp_segment_configuration \
     (dbid, content, role, preferred_role, mode, status, port, hostname, address, datadir) \
     VALUES ($1::int, $2::int, 'm', 'm', 'n', 'u', $3::int, $4, $4, $5)";

/// Registers the rebuilt mirrors. They come up unsynchronized; FTS flips
/// them once WAL replay catches up.
pub async fn add_mirror_rows(client: &Client, intermediate: &Cluster) -> anyhow::Result<()> {
    client
        .batch_execute("BEGIN")
        .await
        .context("beginning transaction")?;
    let result = insert_mirrors(client, intermediate).await;
    commit_or_rollback(client, result).await
}

async fn insert_mirrors(client: &Client, intermediate: &Cluster) -> anyhow::Result<()> {
    for mirror in intermediate.mirrors().filter(|segment| segment.is_mirror()) {
        let datadir = mirror.data_dir.as_str();
        let inserted = client
            .execute(
                INSERT_MIRROR,
                &[
                    &mirror.dbid,
                    &mirror.content,
                    &mirror.port,
                    &mirror.hostname,
                    &datadir,
                ],
            )
            .await
            .with_context(|| format!("adding mirror with content {}", mirror.content))?;
        verify_inserted(inserted, mirror.content)?;
    }
    Ok(())
}

fn verify_inserted(inserted: u64, content: i32) -> anyhow::Result<()> {
    anyhow::ensure!(
        inserted == 1,
        "expected to add 1 mirror row for content {content}, added {inserted}"
    );
    Ok(())
}

/// Recreates the internal replication slot on every primary. One statement
/// reaches all segments through gp_dist_random.
pub async fn recreate_replication_slots(client: &Client) -> anyhow::Result<()> {
    let existing = client
        .query(
            "SELECT slot_name FROM gp_dist_random('pg_replication_slots') WHERE slot_name = $1",
            &[&REPLICATION_SLOT],
        )
        .await
        .context("querying replication slots")?;
    if !existing.is_empty() {
        client
            .query(
                "SELECT pg_drop_replication_slot($1) FROM gp_dist_random('gp_id')",
                &[&REPLICATION_SLOT],
            )
            .await
            .context("dropping replication slots")?;
    }

    client
        .query(
            "SELECT pg_create_physical_replication_slot($1) FROM gp_dist_random('gp_id')",
            &[&REPLICATION_SLOT],
        )
        .await
        .context("creating replication slots")?;
    Ok(())
}
