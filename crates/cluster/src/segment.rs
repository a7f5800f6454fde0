// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Segment role, stored as the single-letter code the catalog uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "p")]
    Primary,
    #[serde(rename = "m")]
    Mirror,
}

impl Role {
    /// The catalog's representation, as used in `gp_segment_configuration`.
    pub fn code(self) -> &'static str {
        match self {
            Role::Primary => "p",
            Role::Mirror => "m",
        }
    }
}

/// One row of the cluster topology. The coordinator is the primary with
/// content -1; the standby is the mirror with content -1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub dbid: i32,
    pub content: i32,
    pub port: i32,
    pub hostname: String,
    pub data_dir: Utf8PathBuf,
    pub role: Role,
}

impl Segment {
    pub fn is_coordinator(&self) -> bool {
        self.content == -1 && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content == -1 && self.role == Role::Mirror
    }

    pub fn is_primary(&self) -> bool {
        self.content != -1 && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content != -1 && self.role == Role::Mirror
    }

    pub fn is_on_host(&self, hostname: &str) -> bool {
        self.hostname == hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_as_catalog_codes() {
        assert_eq!(serde_json::to_string(&Role::Primary).unwrap(), "\"p\"");
        assert_eq!(serde_json::from_str::<Role>("\"m\"").unwrap(), Role::Mirror);
    }

    #[test]
    fn coordinator_and_standby_are_content_minus_one() {
        let coordinator = Segment {
            dbid: 1,
            content: -1,
            port: 5432,
            hostname: "mdw".into(),
            data_dir: "/data/qd/seg-1".into(),
            role: Role::Primary,
        };
        assert!(coordinator.is_coordinator());
        assert!(!coordinator.is_primary());

        let standby = Segment {
            role: Role::Mirror,
            ..coordinator
        };
        assert!(standby.is_standby());
        assert!(!standby.is_mirror());
    }
}
