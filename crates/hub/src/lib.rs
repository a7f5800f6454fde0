// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The hub runs on the coordinator host and drives the whole upgrade. It
//! owns the durable configuration, plans the intermediate cluster, runs the
//! coordinator-side work itself, and fans the per-host work out to the
//! agents over gRPC. Operators talk to it through the streaming phase RPCs:
//! initialize, execute, finalize, and revert.

mod agents;
mod catalog;
mod config;
mod coordinator;
mod execute;
mod finalize;
mod initialize;
mod mirrors;
mod planner;
mod revert;
mod server;
mod standby;

pub use config::Config;
pub use server::{serve, HubOptions, HubService};
