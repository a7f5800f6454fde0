// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! On-disk tablespace verification and removal.
//!
//! A tablespace location holds numerically named children. In the modern
//! layout the child is a segment dbid whose single subdirectory carries the
//! `GPDB_<major>_<catalog_version>` token; in the legacy layout the child is
//! a database oid holding relfilenodes and a `PG_VERSION` file. Both layouts
//! can coexist under one location, and the numeric names can collide, which
//! is why deletion never touches a parent that still has entries.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use uplift_types::ErrorList;

use crate::fs;
use crate::streams::OutStreams;

pub const MAJOR_TOKEN_PREFIX: &str = "GPDB_";

/// The versioned directory a segment's tablespace data lives in:
/// `<location>/<dbid>/GPDB_<major>_<catalog_version>`.
pub fn tablespace_path(
    location: &Utf8Path,
    dbid: i32,
    major_version: u64,
    catalog_version: &str,
) -> Utf8PathBuf {
    location
        .join(dbid.to_string())
        .join(format!("{MAJOR_TOKEN_PREFIX}{major_version}_{catalog_version}"))
}

/// Checks that every child of every location is a recognizable tablespace
/// directory, legacy or modern. All offending paths are reported together.
pub fn verify_tablespace_locations(locations: &[Utf8PathBuf]) -> anyhow::Result<()> {
    let mut errs = ErrorList::new();

    for location in locations {
        let entries = read_dir_sorted(location)?;
        if entries.is_empty() {
            anyhow::bail!("Invalid tablespace directory {location:?}");
        }

        for entry in entries {
            if !entry.is_dir() {
                continue;
            }

            if is_legacy_tablespace_dir(&entry) {
                continue;
            }

            match is_modern_tablespace_dir(&entry) {
                Ok(true) => {}
                Ok(false) => {
                    errs.push(anyhow::anyhow!("Invalid tablespace directory {entry:?}"))
                }
                Err(err) => errs.push(err),
            }
        }
    }

    errs.into_result()
}

/// Legacy (5X) check: the database oid directory carries a `PG_VERSION`
/// file. A missing directory is not legacy; the tablespace may simply hold
/// no tables.
pub fn is_legacy_tablespace_dir(db_oid_dir: &Utf8Path) -> bool {
    fs::path_exists(&db_oid_dir.join("PG_VERSION"))
}

/// Modern (6X and later) check: exactly the versioned `GPDB_` subdirectory
/// is expected. Any other subdirectory name means this is not a tablespace
/// directory we own, and deleting near it would be unsafe.
pub fn is_modern_tablespace_dir(dbid_dir: &Utf8Path) -> anyhow::Result<bool> {
    let entries = read_dir_sorted(dbid_dir)?;
    for entry in entries {
        if !entry.is_dir() {
            continue;
        }
        if !entry
            .file_name()
            .is_some_and(|name| name.starts_with(MAJOR_TOKEN_PREFIX))
        {
            anyhow::bail!(
                "Invalid tablespace directory. Expected {entry:?} to start with {MAJOR_TOKEN_PREFIX:?}."
            );
        }
        return Ok(true);
    }
    Ok(false)
}

/// Deletes versioned tablespace directories and, where that leaves the dbid
/// parent empty, the parent as well. A parent with remaining entries holds
/// legacy data sharing the numeric name and is left alone.
pub fn delete_tablespace_directories(
    dirs: &[Utf8PathBuf],
    streams: &dyn OutStreams,
) -> anyhow::Result<()> {
    for dir in dirs {
        let parent = match dir.parent() {
            Some(parent) => parent,
            None => continue,
        };
        match is_modern_tablespace_dir(parent) {
            Ok(true) => {}
            Ok(false) => anyhow::bail!(
                "refusing to delete {dir}: {parent} is not a tablespace directory"
            ),
            // Removed by a previous attempt.
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err),
        }
    }

    fs::delete_directories(dirs, &[], streams)?;

    for dir in dirs {
        let parent = match dir.parent() {
            Some(parent) => parent,
            None => continue,
        };
        let entries = match read_dir_sorted(parent) {
            Ok(entries) => entries,
            Err(err) if is_not_found(&err) => continue,
            Err(err) => return Err(err),
        };
        // Leftover entries are legacy tablespace data on the same numeric
        // name. The parent stays.
        if !entries.is_empty() {
            continue;
        }
        std::fs::remove_dir(parent.as_std_path())
            .with_context(|| format!("removing empty tablespace parent {parent}"))?;
    }

    Ok(())
}

fn read_dir_sorted(path: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut entries = Vec::new();
    for entry in path
        .read_dir_utf8()
        .with_context(|| format!("read tablespace directory {path:?}"))?
    {
        let entry = entry.with_context(|| format!("read tablespace directory {path:?}"))?;
        entries.push(entry.path().to_owned());
    }
    entries.sort();
    Ok(entries)
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::DevNullStreams;

    const CATALOG_TOKEN: &str = "GPDB_6_301908232";

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    fn make_modern(location: &Utf8Path, dbid: i32) -> Utf8PathBuf {
        let dir = location.join(dbid.to_string()).join(CATALOG_TOKEN);
        std::fs::create_dir_all(dir.join("12812").join("16389")).unwrap();
        dir
    }

    fn make_legacy(location: &Utf8Path, db_oid: u32) {
        let dir = location.join(db_oid.to_string());
        std::fs::create_dir_all(dir.join("16384")).unwrap();
        std::fs::write(dir.join("PG_VERSION"), b"").unwrap();
    }

    #[test]
    fn tablespace_path_joins_dbid_and_version_token() {
        assert_eq!(
            tablespace_path(Utf8Path::new("/fs/16385"), 2, 6, "301908232"),
            Utf8Path::new("/fs/16385/2/GPDB_6_301908232")
        );
    }

    #[test]
    fn mixed_legacy_and_modern_location_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());
        make_modern(&location, 2);
        make_legacy(&location, 12094);

        verify_tablespace_locations(&[location]).unwrap();
    }

    #[test]
    fn unrecognized_child_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());
        std::fs::create_dir_all(location.join("1").join("non_tablespace_directory")).unwrap();

        let err = verify_tablespace_locations(&[location]).unwrap_err();
        assert!(err.to_string().contains("GPDB_"));
    }

    #[test]
    fn empty_location_is_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());

        let err = verify_tablespace_locations(&[location]).unwrap_err();
        assert!(err.to_string().contains("Invalid tablespace directory"));
    }

    #[test]
    fn delete_removes_dir_and_empty_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());
        let dir = make_modern(&location, 2);

        delete_tablespace_directories(&[dir.clone()], &DevNullStreams).unwrap();

        assert!(!fs::path_exists(&dir));
        assert!(!fs::path_exists(&location.join("2")));
    }

    #[test]
    fn legacy_sibling_prevents_parent_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());
        let dir = make_modern(&location, 1);
        // Legacy residue inside the same numeric directory.
        std::fs::write(location.join("1").join("PG_VERSION"), b"").unwrap();

        delete_tablespace_directories(&[dir.clone()], &DevNullStreams).unwrap();

        assert!(!fs::path_exists(&dir));
        assert!(fs::path_exists(&location.join("1")));
    }

    #[test]
    fn delete_is_idempotent_after_parent_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let location = utf8(tmp.path());
        let dir = make_modern(&location, 2);

        delete_tablespace_directories(&[dir.clone()], &DevNullStreams).unwrap();
        delete_tablespace_directories(&[dir], &DevNullStreams).unwrap();
    }
}
