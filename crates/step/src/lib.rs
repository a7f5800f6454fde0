// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The durable substep runner. A phase is an ordered list of substeps; the
//! runner persists each substep's status across crashes, skips completed
//! work on re-invocation, and tees all tool output to both a phase log and
//! the operator's gRPC stream.

mod sender;
mod status;
mod step;
mod stream;

pub use sender::{DiscardSender, MessageSender};
pub use status::{has_completed, has_run, FileStore, SubstepRecord, SubstepStore};
pub use step::{Skip, Step, UserCancelled};
pub use stream::MultiplexedStreams;

#[cfg(any(test, feature = "test-util"))]
pub use step::InjectedFailure;
