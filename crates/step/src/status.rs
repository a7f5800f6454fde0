// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable substep status. One JSON document per state directory, keyed by
//! phase then substep name, rewritten atomically on every transition. The
//! document is the only truth about progress; log files are informational.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use uplift_protocol::common::{Phase, Status, Substep};
use uplift_system::fs::atomic_write;
use uplift_system::paths;

/// Durable state for one (phase, substep) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstepRecord {
    #[serde(
        serialize_with = "serialize_status",
        deserialize_with = "deserialize_status"
    )]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn serialize_status<S: Serializer>(status: &Status, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(status.as_str_name())
}

fn deserialize_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Status, D::Error> {
    let name = String::deserialize(deserializer)?;
    Status::from_str_name(&name)
        .ok_or_else(|| serde::de::Error::custom(format!("unknown substep status {name:?}")))
}

type StatusDocument = BTreeMap<String, BTreeMap<String, SubstepRecord>>;

pub trait SubstepStore: Send + Sync {
    /// Returns the stored record for the pair, or `None` when the substep
    /// has never been attempted.
    fn read(&self, phase: Phase, substep: Substep) -> anyhow::Result<Option<SubstepRecord>>;
    fn write(&self, phase: Phase, substep: Substep, status: Status) -> anyhow::Result<()>;
}

/// The on-disk store, backed by `status.json` in the state directory.
///
/// Every write reloads the document from disk first so concurrent processes
/// never fight an in-memory copy.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Utf8PathBuf,
}

impl FileStore {
    pub fn new(state_dir: &Utf8PathBuf) -> Self {
        FileStore {
            path: paths::status_path(state_dir),
        }
    }

    /// Creates the status document if it does not exist yet. `O_EXCL`
    /// guards the create so two processes racing here cannot each observe
    /// a missing file and clobber the other's seed.
    pub fn ensure_exists(&self) -> anyhow::Result<()> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path.as_std_path())
        {
            Ok(mut file) => {
                file.write_all(b"{}")
                    .with_context(|| format!("seeding {}", self.path))?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                Err(anyhow::Error::new(err).context(format!("creating {}", self.path)))
            }
        }
    }

    fn load(&self) -> anyhow::Result<StatusDocument> {
        let data = std::fs::read_to_string(self.path.as_std_path())
            .with_context(|| format!("reading {}", self.path))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", self.path))
    }
}

impl SubstepStore for FileStore {
    fn read(&self, phase: Phase, substep: Substep) -> anyhow::Result<Option<SubstepRecord>> {
        let document = self.load()?;
        Ok(document
            .get(phase.as_str_name())
            .and_then(|substeps| substeps.get(substep.as_str_name()))
            .cloned())
    }

    fn write(&self, phase: Phase, substep: Substep, status: Status) -> anyhow::Result<()> {
        let mut document = self.load()?;

        let record = document
            .entry(phase.as_str_name().to_string())
            .or_default()
            .entry(substep.as_str_name().to_string())
            .or_insert(SubstepRecord {
                status,
                started_at: None,
                completed_at: None,
            });

        record.status = status;
        match status {
            Status::Running => {
                record.started_at = Some(Utc::now());
                record.completed_at = None;
            }
            Status::Complete | Status::Failed => {
                record.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        let data = serde_json::to_vec_pretty(&document)
            .with_context(|| format!("serializing {}", self.path))?;
        atomic_write(&self.path, &data)
    }
}

/// Whether the substep has ever been attempted in this state directory.
pub fn has_run(state_dir: &Utf8PathBuf, phase: Phase, substep: Substep) -> anyhow::Result<bool> {
    let store = FileStore::new(state_dir);
    if !uplift_system::fs::path_exists(Utf8Path::new(store.path.as_str())) {
        return Ok(false);
    }
    Ok(store.read(phase, substep)?.is_some())
}

/// Whether the substep finished successfully at some point.
pub fn has_completed(
    state_dir: &Utf8PathBuf,
    phase: Phase,
    substep: Substep,
) -> anyhow::Result<bool> {
    let store = FileStore::new(state_dir);
    if !uplift_system::fs::path_exists(Utf8Path::new(store.path.as_str())) {
        return Ok(false);
    }
    Ok(store
        .read(phase, substep)?
        .is_some_and(|record| record.status == Status::Complete))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> (Utf8PathBuf, FileStore) {
        let state_dir = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let store = FileStore::new(&state_dir);
        store.ensure_exists().unwrap();
        (state_dir, store)
    }

    #[test]
    fn unknown_pairs_read_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = store_in(&tmp);

        let record = store
            .read(Phase::Initialize, Substep::StopSourceCluster)
            .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = store_in(&tmp);

        store
            .write(Phase::Execute, Substep::UpgradeCoordinator, Status::Running)
            .unwrap();
        let record = store
            .read(Phase::Execute, Substep::UpgradeCoordinator)
            .unwrap()
            .unwrap();

        assert_eq!(record.status, Status::Running);
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn completion_preserves_start_time() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = store_in(&tmp);

        store
            .write(Phase::Execute, Substep::UpgradeCoordinator, Status::Running)
            .unwrap();
        let started = store
            .read(Phase::Execute, Substep::UpgradeCoordinator)
            .unwrap()
            .unwrap()
            .started_at;

        store
            .write(Phase::Execute, Substep::UpgradeCoordinator, Status::Complete)
            .unwrap();
        let record = store
            .read(Phase::Execute, Substep::UpgradeCoordinator)
            .unwrap()
            .unwrap();

        assert_eq!(record.status, Status::Complete);
        assert_eq!(record.started_at, started);
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn statuses_are_stored_as_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (state_dir, store) = store_in(&tmp);

        store
            .write(Phase::Initialize, Substep::StartAgents, Status::Complete)
            .unwrap();

        let raw = std::fs::read_to_string(paths::status_path(&state_dir)).unwrap();
        assert!(raw.contains("\"INITIALIZE\""));
        assert!(raw.contains("\"START_AGENTS\""));
        assert!(raw.contains("\"COMPLETE\""));
    }

    #[test]
    fn ensure_exists_does_not_clobber_existing_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, store) = store_in(&tmp);

        store
            .write(Phase::Initialize, Substep::StartAgents, Status::Complete)
            .unwrap();
        store.ensure_exists().unwrap();

        assert!(store
            .read(Phase::Initialize, Substep::StartAgents)
            .unwrap()
            .is_some());
    }

    #[test]
    fn has_run_tolerates_a_missing_document() {
        let state_dir =
            Utf8PathBuf::from_path_buf(tempfile::tempdir().unwrap().path().to_owned()).unwrap();
        assert!(!has_run(&state_dir, Phase::Initialize, Substep::StartAgents).unwrap());
    }
}
