// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Local connections to a cluster's coordinator. The hub always connects
//! over localhost as the service user; what varies is the port, whether the
//! session runs in utility mode, and whether catalog writes are allowed.

use anyhow::Context;
use tracing::warn;

/// How the utility-mode GUC is spelled changed in Greenplum 7.
const UTILITY_GUC_PRE_7: &str = "gp_session_role=utility";
const UTILITY_GUC_7: &str = "gp_role=utility";

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    port: i32,
    version: semver::Version,
    utility_mode: bool,
    allow_system_table_mods: bool,
}

impl ConnectionOptions {
    pub fn new(port: i32, version: semver::Version) -> Self {
        ConnectionOptions {
            port,
            version,
            utility_mode: false,
            allow_system_table_mods: false,
        }
    }

    /// Connect to a single postmaster without the dispatcher. Required when
    /// only the coordinator is running.
    pub fn utility_mode(mut self) -> Self {
        self.utility_mode = true;
        self
    }

    /// Permit direct UPDATEs of catalog tables.
    pub fn allow_system_table_mods(mut self) -> Self {
        self.allow_system_table_mods = true;
        self
    }

    pub fn config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host("localhost")
            .port(self.port as u16)
            .dbname("template1")
            .user(&service_user());

        let mut options = Vec::new();
        if self.utility_mode {
            let guc = if self.version.major < 7 {
                UTILITY_GUC_PRE_7
            } else {
                UTILITY_GUC_7
            };
            options.push(format!("-c {guc}"));
        }
        if self.allow_system_table_mods {
            options.push("-c allow_system_table_mods=true".to_string());
        }
        if !options.is_empty() {
            config.options(&options.join(" "));
        }

        config
    }

    /// Opens a connection, driving its I/O on a background task.
    pub async fn connect(&self) -> anyhow::Result<tokio_postgres::Client> {
        let (client, connection) = self
            .config()
            .connect(tokio_postgres::NoTls)
            .await
            .with_context(|| format!("connecting to coordinator on port {}", self.port))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("coordinator connection closed: {err}");
            }
        });

        Ok(client)
    }
}

/// The cluster's service account, used for local connections and for the
/// replication entries written on the segment hosts.
pub fn service_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "gpadmin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utility_mode_guc_depends_on_major_version() {
        let pre7 = ConnectionOptions::new(50432, semver::Version::new(6, 9, 0))
            .utility_mode()
            .config();
        assert_eq!(pre7.get_options(), Some("-c gp_session_role=utility"));

        let v7 = ConnectionOptions::new(50432, semver::Version::new(7, 1, 0))
            .utility_mode()
            .config();
        assert_eq!(v7.get_options(), Some("-c gp_role=utility"));
    }

    #[test]
    fn catalog_mods_require_an_explicit_opt_in() {
        let config = ConnectionOptions::new(5432, semver::Version::new(6, 9, 0)).config();
        assert_eq!(config.get_options(), None);

        let config = ConnectionOptions::new(5432, semver::Version::new(6, 9, 0))
            .utility_mode()
            .allow_system_table_mods()
            .config();
        assert_eq!(
            config.get_options(),
            Some("-c gp_session_role=utility -c allow_system_table_mods=true")
        );
    }

    #[test]
    fn connections_target_the_local_coordinator() {
        let config = ConnectionOptions::new(50432, semver::Version::new(6, 9, 0)).config();
        assert_eq!(config.get_dbname(), Some("template1"));
        assert_eq!(config.get_ports(), &[50432]);
    }
}
