// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared value types used by every uplift crate: the [`ErrorList`]
//! aggregation error, the per-run [`UpgradeId`], and the operator-facing
//! [`NextActionError`] wrapper.

mod errorlist;
mod id;
mod next_action;

pub use errorlist::ErrorList;
pub use id::UpgradeId;
pub use next_action::NextActionError;
