// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-host agent. One runs on every segment host and executes the
//! filesystem and subprocess work the hub fans out: directory creation,
//! renames, deletes, rsync transfers, replication setup, and the
//! page-format upgrade of the primaries on this host.

mod replication;
mod rsync;
mod server;
mod upgrade;

pub use server::{serve, AgentOptions, AgentService};
