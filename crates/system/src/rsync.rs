// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed rsync invocations. The three option sets below are the only ones
//! the upgrade uses; building them here keeps the flags in one place and
//! lets tests assert on the exact command line.

use camino::{Utf8Path, Utf8PathBuf};

use crate::runner::Invocation;

/// Full copy of the upgraded coordinator directory out to the segment hosts.
pub const COPY_OPTIONS: &[&str] = &["--archive", "--compress", "--delete", "--stats"];

/// Restore of an archived source directory during revert. No `--delete`:
/// the live target still holds files the archive lacks and they are excluded
/// instead.
pub const RESTORE_OPTIONS: &[&str] = &["--archive", "--compress", "--stats"];

/// Runtime state that must survive a revert and so is never overwritten from
/// the archived copy.
pub const RESTORE_EXCLUDES: &[&str] = &[
    "pg_hba.conf",
    "postmaster.opts",
    "postgresql.auto.conf",
    "internal.auto.conf",
    "gp_dbid",
    "postgresql.conf",
    "backup_label.old",
    "postmaster.pid",
    "recovery.conf",
];

/// Rebuild of a mirror from its upgraded primary.
pub const MIRROR_REBUILD_OPTIONS: &[&str] = &[
    "--archive",
    "--delete",
    "--hard-links",
    "--size-only",
    "--no-inc-recursive",
];

#[derive(Debug, thiserror::Error)]
pub enum RsyncPlanError {
    #[error("remote rsync to {host} supports exactly one source, got {count}")]
    MultipleRemoteSources { host: String, count: usize },
    #[error("rsync requires at least one source")]
    NoSources,
}

/// Builder for a single rsync run. Sources are given as directories; the
/// trailing slash that makes rsync copy contents rather than the directory
/// itself is appended here.
#[derive(Debug, Clone, Default)]
pub struct Rsync {
    sources: Vec<Utf8PathBuf>,
    destination: Utf8PathBuf,
    destination_host: Option<String>,
    options: Vec<String>,
    excluded_files: Vec<String>,
}

impl Rsync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl AsRef<Utf8Path>) -> Self {
        self.sources.push(source.as_ref().to_owned());
        self
    }

    pub fn sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Utf8Path>,
    {
        self.sources
            .extend(sources.into_iter().map(|p| p.as_ref().to_owned()));
        self
    }

    pub fn destination(mut self, destination: impl AsRef<Utf8Path>) -> Self {
        self.destination = destination.as_ref().to_owned();
        self
    }

    /// Ships to `host:destination` instead of a local path. Empty means
    /// local.
    pub fn destination_host(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        if !host.is_empty() {
            self.destination_host = Some(host);
        }
        self
    }

    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn excluded_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_files
            .extend(files.into_iter().map(Into::into));
        self
    }

    pub fn into_invocation(self) -> Result<Invocation, RsyncPlanError> {
        if self.sources.is_empty() {
            return Err(RsyncPlanError::NoSources);
        }
        if let Some(host) = &self.destination_host {
            if self.sources.len() > 1 {
                return Err(RsyncPlanError::MultipleRemoteSources {
                    host: host.clone(),
                    count: self.sources.len(),
                });
            }
        }

        let mut invocation = Invocation::new("rsync").args(self.options);
        for source in &self.sources {
            invocation = invocation.arg(format!("{source}/"));
        }
        invocation = match &self.destination_host {
            Some(host) => invocation.arg(format!("{host}:{}", self.destination)),
            None => invocation.arg(self.destination.as_str()),
        };
        for file in &self.excluded_files {
            invocation = invocation.arg(format!("--exclude={file}"));
        }
        Ok(invocation)
    }
}
