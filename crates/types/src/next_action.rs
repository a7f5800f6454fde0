// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::error::Error as StdError;
use std::fmt;

/// Attaches operator-facing help text to an existing error. The top-level
/// driver prints the error message first and the help text after it, so the
/// wrapped error's message stays unchanged.
#[derive(Debug)]
pub struct NextActionError {
    err: anyhow::Error,
    next_action: String,
}

impl NextActionError {
    pub fn new(err: anyhow::Error, next_action: impl Into<String>) -> Self {
        NextActionError {
            err,
            next_action: next_action.into(),
        }
    }

    pub fn help(&self) -> String {
        format!("\nNEXT ACTIONS\n------------\n{}", self.next_action)
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.err
    }
}

impl fmt::Display for NextActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.err, f)
    }
}

impl StdError for NextActionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.err.as_ref())
    }
}
