// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Standby re-establishment during finalize. The upgraded catalog knows
//! nothing about a standby, so it is registered from scratch at the
//! planner-chosen location.

use anyhow::Context;
use tracing::debug;

use uplift_cluster::{tools, Cluster};
use uplift_system::runner::CommandRunner;
use uplift_system::streams::OutStreams;

pub async fn upgrade_standby(
    runner: &dyn CommandRunner,
    streams: &dyn OutStreams,
    intermediate: &Cluster,
    use_hba_hostnames: bool,
) -> anyhow::Result<()> {
    let standby = intermediate
        .standby()
        .context("intermediate cluster has no standby")?;

    // Removal fails when no standby is registered yet, which is the normal
    // state on a fresh run.
    let remove = tools::gpinitstandby_remove(&intermediate.gphome, intermediate.coordinator_port());
    if let Err(err) = runner.run(remove, streams).await {
        debug!("removing the standby before re-adding it: {err:#}");
    }

    runner
        .run(
            tools::gpinitstandby_add(
                &intermediate.gphome,
                &standby.hostname,
                standby.port,
                &standby.data_dir,
                use_hba_hostnames,
            ),
            streams,
        )
        .await
        .context("adding the standby")
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use semver::Version;
    use uplift_cluster::{Role, Segment};
    use uplift_system::testing::ScriptedRunner;
    use uplift_system::DevNullStreams;

    fn intermediate() -> Cluster {
        Cluster::new(
            vec![
                Segment {
                    dbid: 1,
                    content: -1,
                    port: 50432,
                    hostname: "mdw".to_string(),
                    data_dir: Utf8PathBuf::from("/data/qd_upgrade/seg-1"),
                    role: Role::Primary,
                },
                Segment {
                    dbid: 6,
                    content: -1,
                    port: 50433,
                    hostname: "smdw".to_string(),
                    data_dir: Utf8PathBuf::from("/data_upgrade/standby"),
                    role: Role::Mirror,
                },
            ],
            "/usr/local/gp6",
            Version::new(6, 9, 0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn a_failing_removal_is_tolerated() {
        let runner = ScriptedRunner::new();
        runner.fail("bash", 1, "no standby configured");

        upgrade_standby(&runner, &DevNullStreams, &intermediate(), false)
            .await
            .unwrap();

        let calls = runner.calls_of("bash");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args[1].contains("gpinitstandby -r -a -P 50432"));
        assert!(calls[1].args[1].contains("gpinitstandby -a -s smdw -P 50433"));
        assert!(calls[1].args[1].contains("-S /data_upgrade/standby"));
    }

    #[tokio::test]
    async fn hba_hostnames_carry_through() {
        let runner = ScriptedRunner::new();

        upgrade_standby(&runner, &DevNullStreams, &intermediate(), true)
            .await
            .unwrap();

        let calls = runner.calls_of("bash");
        assert!(calls[1].args[1].contains("--hba-hostnames"));
    }
}
