// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Channels to the per-host agents and the fan-out helper every multi-host
//! substep goes through. Channels are cached per host for the lifetime of a
//! phase, but every retrieval re-verifies the host still answers; a host
//! that stops answering is evicted and reported by name.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use uplift_cluster::tools;
use uplift_protocol::agent::agent_client::AgentClient;
use uplift_protocol::agent::StopAgentRequest;
use uplift_system::runner::CommandRunner;
use uplift_types::ErrorList;

/// How long a dial may take before the host is declared unreachable.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct AgentConns {
    port: u16,
    channels: Mutex<HashMap<String, Channel>>,
}

impl AgentConns {
    pub fn new(port: u16) -> Self {
        AgentConns {
            port,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn dial(&self, hostname: &str) -> Result<Channel, tonic::transport::Error> {
        Endpoint::from_shared(format!("http://{hostname}:{}", self.port))?
            .connect_timeout(DIAL_TIMEOUT)
            .connect()
            .await
    }

    /// A client for one host. The dial doubles as the readiness check: a
    /// cached channel is only handed out after the host answered a fresh
    /// dial, and a host that stopped answering is evicted. The dial happens
    /// outside the lock; a lost race dials twice and drops the spare.
    pub async fn client(&self, hostname: &str) -> anyhow::Result<AgentClient<Channel>> {
        match self.dial(hostname).await {
            Ok(fresh) => {
                let mut channels = self.channels.lock().await;
                let channel = channels.entry(hostname.to_string()).or_insert(fresh).clone();
                Ok(AgentClient::new(channel))
            }
            Err(err) => {
                self.channels.lock().await.remove(hostname);
                Err(anyhow::Error::new(err)
                    .context(format!("agent on host {hostname} is not ready")))
            }
        }
    }

    /// Verifies every host answers before a fan-out touches any of them, so
    /// down agents are reported up front, together, by name.
    pub async fn ensure_ready(&self, hosts: &[String]) -> anyhow::Result<()> {
        let checks = hosts.iter().map(|host| async move {
            match self.client(host).await {
                Ok(_) => None,
                Err(_) => Some(host.clone()),
            }
        });

        let mut unready: Vec<String> = join_all(checks).await.into_iter().flatten().collect();
        if unready.is_empty() {
            return Ok(());
        }
        unready.sort();
        anyhow::bail!("agents are not ready on hosts: {}", unready.join(", "))
    }

    /// Runs one request per host, concurrently. Every failure is collected
    /// with the offending host named; results arrive in host order.
    pub async fn fan_out<T, F, Fut>(&self, hosts: &[String], request: F) -> anyhow::Result<Vec<T>>
    where
        F: Fn(String, AgentClient<Channel>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.ensure_ready(hosts).await?;

        let request = &request;
        let calls = hosts.iter().map(|host| async move {
            let client = self.client(host).await?;
            request(host.clone(), client)
                .await
                .with_context(|| format!("on host {host}"))
        });

        let mut errs = ErrorList::new();
        let mut results = Vec::new();
        for outcome in join_all(calls).await {
            match outcome {
                Ok(value) => results.push(value),
                Err(err) => errs.push(err),
            }
        }
        errs.into_result()?;
        Ok(results)
    }
}

/// The uplift binary as seen from the remote hosts. The installation is
/// mirrored across hosts, so our own path is theirs.
pub fn agent_binary_path() -> anyhow::Result<String> {
    let exe = std::env::current_exe().context("locating the uplift binary")?;
    Ok(exe.to_string_lossy().into_owned())
}

/// Every host must run the same uplift build as the hub. Mismatched hosts
/// are grouped by the version they report so a partial install reads as one
/// error, not one per host.
pub async fn ensure_versions_match(
    runner: &dyn CommandRunner,
    agent_path: &str,
    hosts: &[String],
) -> anyhow::Result<()> {
    let local = format!("uplift {}", env!("CARGO_PKG_VERSION"));

    let checks = hosts.iter().map(|host| async move {
        let out = runner
            .capture(tools::ssh(host, &format!("{agent_path} --version")))
            .await
            .with_context(|| format!("checking the uplift version on host {host}"))?;
        if !out.success() {
            anyhow::bail!(
                "checking the uplift version on host {host}: {}: {}",
                out.status,
                out.stderr.trim()
            );
        }
        Ok((host.clone(), out.stdout.trim().to_string()))
    });

    let mut errs = ErrorList::new();
    let mut mismatched: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for outcome in join_all(checks).await {
        match outcome {
            Ok((host, version)) => {
                if version != local {
                    mismatched.entry(version).or_default().push(host);
                }
            }
            Err(err) => errs.push(err),
        }
    }
    errs.into_result()?;

    if mismatched.is_empty() {
        return Ok(());
    }
    let mut report = format!("The hub runs \"{local}\" but not every host agrees:");
    for (version, hosts) in &mismatched {
        report.push_str(&format!("\n  \"{version}\": {}", hosts.join(", ")));
    }
    anyhow::bail!(report)
}

/// Ensures an agent answers on every host, starting one over ssh where the
/// dial probe fails. Returns the hosts so the caller can report what runs.
pub async fn restart_agents(
    runner: &dyn CommandRunner,
    conns: &AgentConns,
    agent_path: &str,
    hosts: &[String],
) -> anyhow::Result<Vec<String>> {
    let starts = hosts.iter().map(|host| async move {
        if conns.dial(host).await.is_ok() {
            debug!(%host, "agent already running");
            return Ok(());
        }

        let command = format!("{agent_path} agent --daemonize --port {}", conns.port);
        let out = runner
            .capture(tools::ssh(host, &command))
            .await
            .with_context(|| format!("starting agent on host {host}"))?;
        if !out.success() {
            anyhow::bail!(
                "starting agent on host {host}: {}: {}",
                out.status,
                out.stderr.trim()
            );
        }
        anyhow::ensure!(
            out.stdout.contains("Agent started"),
            "agent on host {host} did not report readiness: {:?}",
            out.stdout.trim()
        );
        Ok(())
    });

    join_all(starts)
        .await
        .into_iter()
        .filter_map(|result: anyhow::Result<()>| result.err())
        .collect::<ErrorList>()
        .into_result()?;
    Ok(hosts.to_vec())
}

/// Stops the agent on every host. Hosts with nothing listening have nothing
/// to stop and are not errors.
pub async fn stop_agents(conns: &AgentConns, hosts: &[String]) -> anyhow::Result<()> {
    let stops = hosts.iter().map(|host| async move {
        let mut client = match conns.client(host).await {
            Ok(client) => client,
            Err(_) => {
                debug!(%host, "agent not reachable, assuming stopped");
                return Ok(());
            }
        };
        match client.stop_agent(StopAgentRequest {}).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == tonic::Code::Unavailable => Ok(()),
            Err(status) => Err(anyhow::Error::new(status)
                .context(format!("stopping agent on host {host}"))),
        }
    });

    join_all(stops)
        .await
        .into_iter()
        .filter_map(|result: anyhow::Result<()>| result.err())
        .collect::<ErrorList>()
        .into_result()
}
