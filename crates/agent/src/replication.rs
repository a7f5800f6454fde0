// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replication plumbing for the rebuilt mirrors: host-based access entries
//! on the primaries and the streaming configuration on the mirrors.

use std::fmt::Write as _;
use std::io::Write as _;

use anyhow::Context;
use camino::Utf8Path;

use uplift_protocol::agent::{RecoveryConfInfo, ReplicationEntry};
use uplift_types::ErrorList;

/// Appends the trust entries a mirror needs to stream from its primary to
/// the primary's `pg_hba.conf`.
pub fn add_replication_entries(entries: &[ReplicationEntry]) -> anyhow::Result<()> {
    let mut errs = ErrorList::new();
    for entry in entries {
        if let Err(err) = append_entries(entry) {
            errs.push(err);
        }
    }
    errs.into_result()
}

fn append_entries(entry: &ReplicationEntry) -> anyhow::Result<()> {
    let mut additions = String::new();
    let user = &entry.user;

    let _ = writeln!(additions, "host replication {user} samehost trust");
    for addr in &entry.host_addrs {
        let _ = writeln!(additions, "host all {user} {addr} trust");
        let _ = writeln!(additions, "host replication {user} {addr} trust");
    }

    let path = Utf8Path::new(&entry.data_dir).join("pg_hba.conf");
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path.as_std_path())
        .with_context(|| format!("opening {path}"))?;
    file.write_all(additions.as_bytes())
        .with_context(|| format!("appending replication entries to {path}"))
}

/// Writes the streaming configuration into each mirror data directory:
/// an empty `standby.signal` and the `primary_conninfo` pointing at the
/// upgraded primary.
pub fn create_recovery_conf(infos: &[RecoveryConfInfo]) -> anyhow::Result<()> {
    let mut errs = ErrorList::new();
    for info in infos {
        if let Err(err) = write_recovery_conf(info) {
            errs.push(err);
        }
    }
    errs.into_result()
}

fn write_recovery_conf(info: &RecoveryConfInfo) -> anyhow::Result<()> {
    let config = format!(
        "primary_conninfo = 'user={} host={} port={} sslmode=disable \
         sslcompression=0 gssencmode=disable target_session_attrs=any \
         application_name=gp_walreceiver'\n\
         primary_slot_name = 'internal_wal_replication_slot'\n",
        info.user, info.target_primary_hostname, info.target_primary_port
    );

    let mirror = Utf8Path::new(&info.mirror_data_dir);
    let signal = mirror.join("standby.signal");
    std::fs::write(signal.as_std_path(), b"")
        .with_context(|| format!("writing {signal}"))?;

    let conf = mirror.join("postgresql.auto.conf");
    std::fs::write(conf.as_std_path(), config.as_bytes())
        .with_context(|| format!("writing {conf}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    #[test]
    fn replication_entries_are_appended_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let datadir = utf8(tmp.path());
        std::fs::write(datadir.join("pg_hba.conf"), "local all all trust\n").unwrap();

        add_replication_entries(&[ReplicationEntry {
            data_dir: datadir.clone().into_string(),
            user: "gpadmin".into(),
            host_addrs: vec!["sdw1".into(), "sdw2".into()],
        }])
        .unwrap();

        let contents = std::fs::read_to_string(datadir.join("pg_hba.conf")).unwrap();
        assert_eq!(
            contents,
            "local all all trust\n\
             host replication gpadmin samehost trust\n\
             host all gpadmin sdw1 trust\n\
             host replication gpadmin sdw1 trust\n\
             host all gpadmin sdw2 trust\n\
             host replication gpadmin sdw2 trust\n"
        );
    }

    #[test]
    fn missing_pg_hba_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let datadir = utf8(tmp.path());

        let err = add_replication_entries(&[ReplicationEntry {
            data_dir: datadir.into_string(),
            user: "gpadmin".into(),
            host_addrs: vec![],
        }])
        .unwrap_err();

        assert!(format!("{err:#}").contains("pg_hba.conf"));
    }

    #[test]
    fn recovery_conf_points_the_mirror_at_its_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = utf8(tmp.path());

        create_recovery_conf(&[RecoveryConfInfo {
            target_primary_hostname: "sdw1".into(),
            target_primary_port: 50434,
            user: "gpadmin".into(),
            mirror_data_dir: mirror.clone().into_string(),
        }])
        .unwrap();

        assert!(mirror.join("standby.signal").exists());
        let conf = std::fs::read_to_string(mirror.join("postgresql.auto.conf")).unwrap();
        assert!(conf.contains("host=sdw1"));
        assert!(conf.contains("port=50434"));
        assert!(conf.contains("primary_slot_name = 'internal_wal_replication_slot'"));
    }
}
