// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The cluster model: an immutable-after-load description of one Greenplum
//! cluster (segments, ports, data directories, tablespaces) plus the typed
//! invocations of the vendor utilities that manage it.

pub mod cluster;
pub mod connection;
pub mod fts;
pub mod segment;
pub mod tablespaces;
pub mod tools;
pub mod version;

pub use cluster::{Cluster, InvalidSegmentsError};
pub use segment::{Role, Segment};
pub use tablespaces::{SegmentTablespaces, TablespaceInfo, Tablespaces};

/// The dbid the coordinator always occupies.
pub const COORDINATOR_DBID: i32 = 1;
