// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Host-level plumbing shared by the hub and the agents: typed subprocess
//! invocations, output streams, the on-disk state directory layout, and the
//! directory rename and delete primitives the upgrade relies on.

pub mod conf;
pub mod disk;
pub mod fs;
pub mod paths;
pub mod rsync;
pub mod runner;
pub mod streams;
pub mod tablespaces;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use runner::{CapturedOutput, CommandRunner, ExecError, Invocation, LocalRunner};
pub use streams::{BufferedStreams, DevNullStreams, OutStreams};
