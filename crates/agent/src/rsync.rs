// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fan-out execution of the hub's rsync requests. The pairs are independent
//! so they run concurrently; every failure is reported, not just the first.

use futures::future::join_all;

use uplift_protocol::agent::RsyncRequest;
use uplift_system::rsync::Rsync;
use uplift_system::{CommandRunner, DevNullStreams};
use uplift_types::ErrorList;

pub async fn run_pairs(runner: &dyn CommandRunner, request: &RsyncRequest) -> anyhow::Result<()> {
    let transfers = request.pairs.iter().map(|pair| async {
        let invocation = Rsync::new()
            .source(&pair.source)
            .destination_host(pair.destination_host.clone())
            .destination(&pair.destination)
            .options(request.options.iter().cloned())
            .excluded_files(request.excluded_files.iter().cloned())
            .into_invocation()?;

        runner.run(invocation, &DevNullStreams).await?;
        Ok(())
    });

    join_all(transfers)
        .await
        .into_iter()
        .filter_map(|result: anyhow::Result<()>| result.err())
        .collect::<ErrorList>()
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplift_protocol::agent::RsyncPair;
    use uplift_system::testing::ScriptedRunner;

    fn request() -> RsyncRequest {
        RsyncRequest {
            pairs: vec![
                RsyncPair {
                    source: "/data/seg0".into(),
                    destination_host: String::new(),
                    destination: "/backup/seg0".into(),
                },
                RsyncPair {
                    source: "/data/seg1".into(),
                    destination_host: String::new(),
                    destination: "/backup/seg1".into(),
                },
            ],
            options: vec!["--archive".into()],
            excluded_files: vec![],
        }
    }

    #[tokio::test]
    async fn every_pair_is_transferred() {
        let runner = ScriptedRunner::new();
        run_pairs(&runner, &request()).await.unwrap();

        let calls = runner.calls_of("rsync");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["--archive", "/data/seg0/", "/backup/seg0"]);
    }

    #[tokio::test]
    async fn one_failing_pair_does_not_hide_the_other() {
        let runner = ScriptedRunner::new();
        runner.fail("rsync", 23, "partial transfer");

        let err = run_pairs(&runner, &request()).await.unwrap_err();

        assert_eq!(runner.calls_of("rsync").len(), 2);
        assert!(err.to_string().contains("partial transfer"));
    }
}
