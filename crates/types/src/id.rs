// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A unique identifier for one upgrade run, assigned when the source cluster
/// configuration is first saved and persisted in `config.json`. It names the
/// log archive directory after finalize and revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpgradeId(u64);

impl UpgradeId {
    /// Creates a new identifier that is reasonably unique across executions.
    pub fn random() -> Self {
        loop {
            let id = UpgradeId(rand::random());

            // gpstart mishandles "--" in directory names, so reject ids whose
            // encoding would contain one.
            if !id.to_string().contains("--") {
                return id;
            }
        }
    }

    pub fn from_raw(raw: u64) -> Self {
        UpgradeId(raw)
    }
}

impl fmt::Display for UpgradeId {
    /// Unpadded, filesystem-safe base64 encoding of the identifier.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_le_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_filesystem_safe() {
        for _ in 0..64 {
            let id = UpgradeId::random();
            let repr = id.to_string();
            assert_eq!(repr.len(), 11); // 8 bytes, unpadded base64
            assert!(!repr.contains('/'));
            assert!(!repr.contains('+'));
            assert!(!repr.contains("--"));
        }
    }

    #[test]
    fn serializes_as_number() {
        let id = UpgradeId(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: UpgradeId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
