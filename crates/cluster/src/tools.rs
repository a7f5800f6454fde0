// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Typed invocations of the vendor utilities. The gp* management scripts
//! need `greenplum_path.sh` sourced first, so they run through a bash
//! wrapper; pg_upgrade runs directly with a scrubbed environment.

use camino::Utf8Path;

use uplift_system::runner::Invocation;

/// Wraps a management script so it runs with the installation's environment.
pub fn gp_script(gphome: &Utf8Path, command: &str) -> Invocation {
    Invocation::new("bash").arg("-c").arg(format!(
        "source {gphome}/greenplum_path.sh && {gphome}/bin/{command}"
    ))
}

pub fn gpstart(gphome: &Utf8Path, coordinator_data_dir: &Utf8Path, coordinator_only: bool) -> Invocation {
    let mode = if coordinator_only { "-m " } else { "" };
    gp_script(gphome, &format!("gpstart {mode}-a -d {coordinator_data_dir}"))
}

pub fn gpstop(gphome: &Utf8Path, coordinator_data_dir: &Utf8Path, coordinator_only: bool) -> Invocation {
    let mode = if coordinator_only { "-m " } else { "" };
    gp_script(gphome, &format!("gpstop {mode}-a -d {coordinator_data_dir}"))
}

/// Pre-7X gpinitsystem exits nonzero for warnings alone, so those versions
/// run with `--ignore-warnings`.
pub fn gpinitsystem(gphome: &Utf8Path, config_path: &Utf8Path, ignore_warnings: bool) -> Invocation {
    let ignore = if ignore_warnings { " --ignore-warnings" } else { "" };
    gp_script(gphome, &format!("gpinitsystem -a -I {config_path}{ignore}"))
}

pub fn gpaddmirrors(gphome: &Utf8Path, config_path: &Utf8Path, hba_hostnames: bool) -> Invocation {
    let hba = if hba_hostnames { " --hba-hostnames" } else { "" };
    gp_script(gphome, &format!("gpaddmirrors -a -i {config_path}{hba}"))
}

pub fn gpinitstandby_remove(gphome: &Utf8Path, coordinator_port: i32) -> Invocation {
    gp_script(gphome, &format!("gpinitstandby -r -a -P {coordinator_port}"))
}

pub fn gpinitstandby_add(
    gphome: &Utf8Path,
    hostname: &str,
    port: i32,
    data_dir: &Utf8Path,
    hba_hostnames: bool,
) -> Invocation {
    let hba = if hba_hostnames { " --hba-hostnames" } else { "" };
    gp_script(
        gphome,
        &format!("gpinitstandby -a -s {hostname} -P {port} -S {data_dir}{hba}"),
    )
}

pub fn gprecoverseg(gphome: &Utf8Path, coordinator_data_dir: &Utf8Path) -> Invocation {
    gp_script(gphome, &format!("gprecoverseg -a -d {coordinator_data_dir}"))
}

pub fn pgrep_pidfile(pidfile: &Utf8Path) -> Invocation {
    Invocation::new("pgrep").args(["-F", pidfile.as_str()])
}

/// Remote execution on a segment host. BatchMode keeps a missing key from
/// degenerating into a password prompt on a headless hub.
pub fn ssh(hostname: &str, command: &str) -> Invocation {
    Invocation::new("ssh")
        .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"])
        .arg(hostname)
        .arg(command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgUpgradeMode {
    Dispatcher,
    Segment,
}

impl PgUpgradeMode {
    fn flag(self) -> &'static str {
        match self {
            PgUpgradeMode::Dispatcher => "dispatcher",
            PgUpgradeMode::Segment => "segment",
        }
    }
}

/// One pg_upgrade run for a source/target segment pair.
#[derive(Debug, Clone)]
pub struct PgUpgrade {
    pub source_bindir: String,
    pub target_bindir: String,
    pub source_dbid: i32,
    pub target_dbid: i32,
    pub source_data_dir: String,
    pub target_data_dir: String,
    pub source_port: i32,
    pub target_port: i32,
    pub mode: PgUpgradeMode,
    pub check_only: bool,
    pub use_link_mode: bool,
    pub tablespaces_file: Option<String>,
    pub old_options: Option<String>,
    /// Log files are retained here.
    pub working_dir: String,
}

impl PgUpgrade {
    pub fn into_invocation(self) -> Invocation {
        let mut invocation = Invocation::new(format!("{}/pg_upgrade", self.target_bindir))
            .args([
                "--retain",
                "--old-bindir",
                &self.source_bindir,
                "--new-bindir",
                &self.target_bindir,
                "--old-gp-dbid",
                &self.source_dbid.to_string(),
                "--new-gp-dbid",
                &self.target_dbid.to_string(),
                "--old-datadir",
                &self.source_data_dir,
                "--new-datadir",
                &self.target_data_dir,
                "--old-port",
                &self.source_port.to_string(),
                "--new-port",
                &self.target_port.to_string(),
                "--mode",
                self.mode.flag(),
            ]);

        if self.check_only {
            invocation = invocation.arg("--check");
        }
        if self.use_link_mode {
            invocation = invocation.arg("--link");
        }
        if let Some(file) = &self.tablespaces_file {
            invocation = invocation.args(["--old-tablespaces-file", file]);
        }
        if let Some(options) = &self.old_options {
            invocation = invocation.args(["--old-options", options]);
        }

        // PGPORT and friends must not leak into pg_upgrade.
        invocation
            .current_dir(self.working_dir)
            .clear_env()
            .env("__GPDB_PGUPGRADE_PRINT_TIMING__", "1")
    }
}
