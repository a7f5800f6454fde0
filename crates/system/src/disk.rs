// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Free-space probing for the pre-upgrade disk check. Paths living on the
//! same filesystem are collapsed to one entry, keyed by the filesystem id.

use std::collections::HashMap;

use anyhow::Context;
use camino::Utf8PathBuf;
use nix::sys::statvfs::statvfs;

use crate::fs::hostname;

/// A filesystem that does not meet the required free-space ratio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortfallUsage {
    /// The first checked path on this filesystem, standing in for the mount.
    pub fs: Utf8PathBuf,
    pub host: String,
    pub available_bytes: u64,
    pub required_bytes: u64,
}

/// Checks that every filesystem backing `paths` has at least `free_ratio`
/// of its capacity free. Returns the set of filesystems that fall short;
/// an empty vec means the check passed.
pub fn check_usage(
    free_ratio: f64,
    paths: &[Utf8PathBuf],
) -> anyhow::Result<Vec<ShortfallUsage>> {
    let host = hostname();
    let mut seen: HashMap<u64, ShortfallUsage> = HashMap::new();
    let mut order = Vec::new();

    for path in paths {
        let stat = statvfs(path.as_std_path())
            .with_context(|| format!("checking disk space for {path}"))?;

        let fsid = stat.filesystem_id();
        if seen.contains_key(&fsid) {
            continue;
        }

        let frsize = stat.fragment_size() as u64;
        let available = stat.blocks_available() as u64 * frsize;
        let total = stat.blocks() as u64 * frsize;
        let required = (total as f64 * free_ratio) as u64;

        if available < required {
            order.push(fsid);
            seen.insert(
                fsid,
                ShortfallUsage {
                    fs: path.clone(),
                    host: host.clone(),
                    available_bytes: available,
                    required_bytes: required,
                },
            );
        } else {
            // Remember the filesystem so a later sibling path is not
            // re-checked, without reporting it.
            seen.insert(
                fsid,
                ShortfallUsage {
                    fs: path.clone(),
                    host: host.clone(),
                    available_bytes: available,
                    required_bytes: 0,
                },
            );
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|fsid| seen.remove(&fsid))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ratio_always_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();

        let failed = check_usage(0.0, &[path]).unwrap();
        assert!(failed.is_empty());
    }

    #[test]
    fn impossible_ratio_reports_the_filesystem_once() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
        let a = root.join("a");
        let b = root.join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        // Nothing has 200% free.
        let failed = check_usage(2.0, &[a.clone(), b]).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].fs, a);
        assert!(failed[0].available_bytes < failed[0].required_bytes);
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = check_usage(0.5, &[Utf8PathBuf::from("/no/such/path")]).unwrap_err();
        assert!(err.to_string().contains("checking disk space"));
    }
}
