// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The tablespace model: which user-defined storage locations each segment
//! owns. Loaded once from the source catalog before the upgrade and also
//! written out as the mapping file the page-format tool consumes.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::COORDINATOR_DBID;

/// Only tablespaces with this set are relocated; system tablespaces live
/// inside the data directory and follow it implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub location: Utf8PathBuf,
    pub user_defined: bool,
}

/// Tablespaces of one segment, keyed by tablespace oid.
pub type SegmentTablespaces = BTreeMap<u32, TablespaceInfo>;

/// Tablespaces of the whole cluster, keyed by segment dbid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tablespaces(BTreeMap<i32, SegmentTablespaces>);

impl Tablespaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dbid: i32, oid: u32, info: TablespaceInfo) {
        self.0.entry(dbid).or_default().insert(oid, info);
    }

    pub fn for_dbid(&self, dbid: i32) -> Option<&SegmentTablespaces> {
        self.0.get(&dbid)
    }

    pub fn coordinator(&self) -> Option<&SegmentTablespaces> {
        self.for_dbid(COORDINATOR_DBID)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every user-defined (dbid, oid, info) triple, ascending by dbid then
    /// oid.
    pub fn user_defined(&self) -> impl Iterator<Item = (i32, u32, &TablespaceInfo)> {
        self.0.iter().flat_map(|(dbid, spaces)| {
            spaces
                .iter()
                .filter(|(_, info)| info.user_defined)
                .map(move |(oid, info)| (*dbid, *oid, info))
        })
    }

    /// The distinct user-defined locations for one segment.
    pub fn user_defined_locations(&self, dbid: i32) -> Vec<&Utf8Path> {
        self.for_dbid(dbid)
            .into_iter()
            .flat_map(|spaces| spaces.values())
            .filter(|info| info.user_defined)
            .map(|info| info.location.as_path())
            .collect()
    }
}

/// One row of the tablespace query, preserved in query order for the
/// mapping file.
#[derive(Debug, Clone, PartialEq)]
pub struct TablespaceTuple {
    pub dbid: i32,
    pub oid: u32,
    pub name: String,
    pub location: Utf8PathBuf,
    pub user_defined: bool,
}

/// The catalog query against a 5X coordinator. User-defined tablespaces get
/// their per-oid location; system tablespaces report the filespace root.
const TABLESPACES_QUERY: &str = "
    SELECT
        fsedbid::int as dbid,
        upgrade_tablespace.oid::int as oid,
        spcname as name,
        case when is_user_defined_tablespace then location_with_oid else fselocation end as location,
        is_user_defined_tablespace as userdefined
    FROM (
            SELECT
                pg_tablespace.oid,
                *,
                (fselocation || '/' || pg_tablespace.oid) as location_with_oid,
                (spcname not in ('pg_default', 'pg_global')) as is_user_defined_tablespace
            FROM pg_tablespace
            INNER JOIN pg_filespace_entry
            ON fsefsoid = spcfsoid
        ) upgrade_tablespace";

pub async fn query_tuples(
    client: &tokio_postgres::Client,
) -> anyhow::Result<Vec<TablespaceTuple>> {
    let rows = client
        .query(TABLESPACES_QUERY, &[])
        .await
        .context("retrieving tablespace information")?;

    rows.iter()
        .map(|row| {
            let dbid: i32 = row.try_get("dbid")?;
            let oid: i32 = row.try_get("oid")?;
            let name: String = row.try_get("name")?;
            let location: String = row.try_get("location")?;
            let user_defined: bool = row.try_get("userdefined")?;
            Ok(TablespaceTuple {
                dbid,
                oid: oid as u32,
                name,
                location: Utf8PathBuf::from(location),
                user_defined,
            })
        })
        .collect::<Result<_, tokio_postgres::Error>>()
        .context("decoding tablespace rows")
}

/// Renders the mapping file consumed by the page-format tool: one CSV line
/// per tuple, `dbid,oid,name,location,userdefined`.
pub fn render_mapping_file(tuples: &[TablespaceTuple]) -> String {
    let mut out = String::new();
    for tuple in tuples {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            tuple.dbid,
            tuple.oid,
            tuple.name,
            tuple.location,
            if tuple.user_defined { 1 } else { 0 }
        );
    }
    out
}

/// Folds query tuples into the per-segment model.
pub fn from_tuples(tuples: &[TablespaceTuple]) -> Tablespaces {
    let mut tablespaces = Tablespaces::new();
    for tuple in tuples {
        tablespaces.insert(
            tuple.dbid,
            tuple.oid,
            TablespaceInfo {
                location: tuple.location.clone(),
                user_defined: tuple.user_defined,
            },
        );
    }
    tablespaces
}
