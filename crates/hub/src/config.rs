// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The hub's durable configuration, persisted as `config.json` in the state
//! directory. It is written once by initialize and reloaded at the start of
//! every later phase, so a hub restart loses nothing.

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use uplift_cluster::{Cluster, Tablespaces};
use uplift_system::{fs, paths};
use uplift_types::UpgradeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub upgrade_id: UpgradeId,

    /// The source cluster as it was at initialize time.
    pub source: Cluster,

    /// The planned copy of the source under the target installation, on
    /// temporary ports and `_upgrade` directories. Absent until the planner
    /// has run.
    pub intermediate: Option<Cluster>,

    pub target_gphome: Utf8PathBuf,
    pub agent_port: u16,
    pub use_link_mode: bool,
    pub use_hba_hostnames: bool,
    pub disk_free_ratio: f64,

    /// Per-dbid tablespaces, populated only for 5X sources; later versions
    /// let pg_upgrade discover them itself.
    #[serde(default)]
    pub tablespaces: Tablespaces,

    /// "Catalog version number" reported by the target's pg_controldata.
    /// Tablespace paths on disk embed it, so revert needs it to find the
    /// directories the upgrade created.
    #[serde(default)]
    pub target_catalog_version: Option<String>,

    /// Where finalize or revert parked the log directory. Persisted so a
    /// rerun reuses the same archive instead of minting a second one.
    #[serde(default)]
    pub log_archive_dir: Option<Utf8PathBuf>,
}

impl Config {
    pub fn load(state_dir: &Utf8PathBuf) -> anyhow::Result<Self> {
        let path = paths::config_path(state_dir);
        let raw = std::fs::read_to_string(path.as_std_path())
            .with_context(|| format!("reading {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
    }

    pub fn save(&self, state_dir: &Utf8PathBuf) -> anyhow::Result<()> {
        let rendered = serde_json::to_vec_pretty(self).context("serializing configuration")?;
        fs::atomic_write(&paths::config_path(state_dir), &rendered)
    }

    pub fn intermediate(&self) -> anyhow::Result<&Cluster> {
        self.intermediate
            .as_ref()
            .context("no intermediate cluster has been planned; run initialize first")
    }

    /// The final cluster finalize leaves behind: the source's topology,
    /// ports, and directories, running the target installation.
    pub fn target_cluster(&self) -> anyhow::Result<Cluster> {
        let intermediate = self.intermediate()?;
        let segments = self.source.select(|_| true).into_iter().cloned().collect();
        Cluster::new(segments, &self.target_gphome, intermediate.version.clone())
            .context("deriving the final cluster")
    }

    /// Hosts that run an agent: every host carrying a segment, except the
    /// hub's own.
    pub fn agent_hosts(&self) -> Vec<String> {
        self.source
            .hostnames()
            .into_iter()
            .filter(|host| host != self.source.coordinator_hostname())
            .collect()
    }

    pub fn get(&self, name: &str) -> anyhow::Result<String> {
        Ok(match name {
            "id" => self.upgrade_id.to_string(),
            "source-gphome" => self.source.gphome.to_string(),
            "target-gphome" => self.target_gphome.to_string(),
            "target-datadir" => self.intermediate()?.coordinator_data_dir().to_string(),
            "target-port" => self.intermediate()?.coordinator_port().to_string(),
            "use-link-mode" => self.use_link_mode.to_string(),
            "use-hba-hostnames" => self.use_hba_hostnames.to_string(),
            _ => bail!("unknown configuration name {name:?}"),
        })
    }

    pub fn set(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        match name {
            "source-gphome" => {
                let segments: Vec<_> =
                    self.source.select(|_| true).into_iter().cloned().collect();
                self.source = Cluster::new(segments, value, self.source.version.clone())
                    .context("updating source-gphome")?;
            }
            "target-gphome" => self.target_gphome = Utf8PathBuf::from(value),
            "use-link-mode" => {
                self.use_link_mode = value
                    .parse()
                    .with_context(|| format!("parsing {value:?} as a boolean"))?;
            }
            "use-hba-hostnames" => {
                self.use_hba_hostnames = value
                    .parse()
                    .with_context(|| format!("parsing {value:?} as a boolean"))?;
            }
            _ => bail!("configuration name {name:?} cannot be changed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use uplift_cluster::{Role, Segment};

    fn seg(dbid: i32, content: i32, port: i32, host: &str, dir: &str, role: Role) -> Segment {
        Segment {
            dbid,
            content,
            port,
            hostname: host.to_string(),
            data_dir: Utf8PathBuf::from(dir),
            role,
        }
    }

    fn source() -> Cluster {
        Cluster::new(
            vec![
                seg(1, -1, 5432, "mdw", "/data/qd/seg-1", Role::Primary),
                seg(2, 0, 6000, "sdw1", "/data/p/seg0", Role::Primary),
                seg(3, 1, 6000, "sdw2", "/data/p/seg1", Role::Primary),
            ],
            "/usr/local/gp5",
            semver::Version::new(5, 29, 10),
        )
        .unwrap()
    }

    fn config() -> Config {
        Config {
            upgrade_id: UpgradeId::from_raw(42),
            source: source(),
            intermediate: None,
            target_gphome: Utf8PathBuf::from("/usr/local/gp6"),
            agent_port: 6416,
            use_link_mode: false,
            use_hba_hostnames: false,
            disk_free_ratio: 0.2,
            tablespaces: Tablespaces::new(),
            target_catalog_version: None,
            log_archive_dir: None,
        }
    }

    fn state_dir(tmp: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap()
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = state_dir(&tmp);

        let config = config();
        config.save(&dir).unwrap();
        let loaded = Config::load(&dir).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn intermediate_is_an_error_until_planned() {
        let config = config();
        let err = config.intermediate().unwrap_err();
        assert!(err.to_string().contains("run initialize first"));
    }

    #[test]
    fn target_cluster_keeps_topology_and_swaps_installation() {
        let mut config = config();
        let planned = crate::planner::plan(
            &config.source,
            &[50432, 50433],
            &config.target_gphome,
            semver::Version::new(6, 9, 0),
        )
        .unwrap();
        config.intermediate = Some(planned);

        let target = config.target_cluster().unwrap();

        assert_eq!(target.gphome, Utf8PathBuf::from("/usr/local/gp6"));
        assert_eq!(target.version, semver::Version::new(6, 9, 0));
        assert_eq!(target.coordinator_port(), 5432);
        assert_eq!(
            target.coordinator_data_dir(),
            Utf8PathBuf::from("/data/qd/seg-1")
        );
    }

    #[test]
    fn agent_hosts_exclude_the_coordinator_host() {
        let hosts = config().agent_hosts();
        assert_eq!(hosts, vec!["sdw1".to_string(), "sdw2".to_string()]);
    }

    #[test]
    fn get_and_set_cover_the_operator_visible_names() {
        let mut config = config();

        assert_eq!(config.get("source-gphome").unwrap(), "/usr/local/gp5");
        assert!(config.get("bogus").is_err());
        assert!(config.get("target-port").is_err());

        config.set("target-gphome", "/usr/local/gp6.21").unwrap();
        assert_eq!(config.get("target-gphome").unwrap(), "/usr/local/gp6.21");

        config.set("use-link-mode", "true").unwrap();
        assert!(config.use_link_mode);
        assert!(config.set("use-link-mode", "yes").is_err());
        assert!(config.set("id", "other").is_err());
    }
}
