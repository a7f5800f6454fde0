// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The hub gRPC service. Phase methods spawn the phase off the request task
//! and hand the operator the receiving end of its message stream, so a
//! dropped connection never interrupts a running upgrade step.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use uplift_protocol::common::Message;
use uplift_protocol::hub::hub_server::{Hub, HubServer};
use uplift_protocol::hub::*;
use uplift_step::MessageSender;
use uplift_system::{paths, CommandRunner, LocalRunner};
use uplift_types::NextActionError;

use crate::agents::{self, AgentConns};
use crate::config::Config;
use crate::{execute, finalize, initialize, revert};

pub struct HubOptions {
    pub port: u16,
    /// Print the readiness line a daemonizing parent waits for.
    pub daemonize: bool,
}

pub struct HubService {
    runner: Arc<dyn CommandRunner>,
    state_dir: Utf8PathBuf,
    shutdown: Arc<Notify>,
}

impl HubService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        state_dir: Utf8PathBuf,
        shutdown: Arc<Notify>,
    ) -> Self {
        HubService {
            runner,
            state_dir,
            shutdown,
        }
    }
}

/// Binds the hub listener and serves until `StopServices` arrives.
pub async fn serve(options: HubOptions) -> anyhow::Result<()> {
    let state_dir = paths::state_dir();
    paths::ensure_state_dir(&state_dir)?;

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, options.port).into();
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    if options.daemonize {
        // The parent process blocks on this exact line before detaching.
        println!(
            "Hub started on port {} (pid {})",
            local.port(),
            std::process::id()
        );
    }
    info!(address = %local, "hub listening");

    let shutdown = Arc::new(Notify::new());
    let service = HubService::new(Arc::new(LocalRunner), state_dir, shutdown.clone());

    Server::builder()
        .add_service(HubServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.notified().await;
            info!("hub shutting down");
        })
        .await?;
    Ok(())
}

type MessageStream = UnboundedReceiverStream<Result<Message, Status>>;

/// Forwards phase messages onto the operator's response stream.
struct StreamSender(mpsc::UnboundedSender<Result<Message, Status>>);

impl MessageSender for StreamSender {
    fn send(&self, message: Message) -> anyhow::Result<()> {
        self.0
            .send(Ok(message))
            .map_err(|_| anyhow::anyhow!("operator stream closed"))
    }
}

/// A phase failure as the operator sees it: the full context chain, plus the
/// next-action help when one was attached.
fn phase_status(err: &anyhow::Error) -> Status {
    let mut message = format!("{err:#}");
    if let Some(next) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<NextActionError>())
    {
        message.push_str(&next.help());
    }
    Status::internal(message)
}

fn spawn_phase<F, Fut>(action: F) -> Response<MessageStream>
where
    F: FnOnce(Arc<dyn MessageSender>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let sender: Arc<dyn MessageSender> = Arc::new(StreamSender(tx.clone()));

    let fut = action(sender);
    tokio::spawn(async move {
        if let Err(err) = fut.await {
            // A send failure only means the operator hung up; the error is
            // already durable in the status store.
            if tx.send(Err(phase_status(&err))).is_err() {
                debug!("phase failed after the operator disconnected: {err:#}");
            }
        }
    });

    Response::new(UnboundedReceiverStream::new(rx))
}

fn invalid(err: anyhow::Error) -> Status {
    Status::invalid_argument(format!("{err:#}"))
}

fn internal(err: anyhow::Error) -> Status {
    Status::internal(format!("{err:#}"))
}

#[tonic::async_trait]
impl Hub for HubService {
    type InitializeStream = MessageStream;
    type ExecuteStream = MessageStream;
    type FinalizeStream = MessageStream;
    type RevertStream = MessageStream;

    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> Result<Response<Self::InitializeStream>, Status> {
        let request = request.into_inner();
        info!("starting initialize");

        let options = initialize::InitializeOptions {
            source_gphome: Utf8PathBuf::from(request.source_gphome),
            source_port: request.source_port,
            target_gphome: Utf8PathBuf::from(request.target_gphome),
            temp_port_range: request.ports,
            agent_port: u16::try_from(request.agent_port)
                .map_err(|_| Status::invalid_argument("agent_port out of range"))?,
            use_link_mode: request.use_link_mode,
            use_hba_hostnames: request.use_hba_hostnames,
            disk_free_ratio: request.disk_free_ratio,
        };
        let runner = Arc::clone(&self.runner);
        let state_dir = self.state_dir.clone();
        Ok(spawn_phase(move |sender| async move {
            initialize::run(runner.as_ref(), &state_dir, sender, options).await
        }))
    }

    async fn execute(
        &self,
        _request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        info!("starting execute");

        let runner = Arc::clone(&self.runner);
        let state_dir = self.state_dir.clone();
        Ok(spawn_phase(move |sender| async move {
            execute::run(runner.as_ref(), &state_dir, sender).await
        }))
    }

    async fn finalize(
        &self,
        _request: Request<FinalizeRequest>,
    ) -> Result<Response<Self::FinalizeStream>, Status> {
        info!("starting finalize");

        let runner = Arc::clone(&self.runner);
        let state_dir = self.state_dir.clone();
        Ok(spawn_phase(move |sender| async move {
            finalize::run(runner.as_ref(), &state_dir, sender).await
        }))
    }

    async fn revert(
        &self,
        _request: Request<RevertRequest>,
    ) -> Result<Response<Self::RevertStream>, Status> {
        info!("starting revert");

        let runner = Arc::clone(&self.runner);
        let state_dir = self.state_dir.clone();
        Ok(spawn_phase(move |sender| async move {
            revert::run(runner.as_ref(), &state_dir, sender).await
        }))
    }

    async fn restart_agents(
        &self,
        _request: Request<RestartAgentsRequest>,
    ) -> Result<Response<RestartAgentsReply>, Status> {
        let config = Config::load(&self.state_dir).map_err(internal)?;
        let conns = AgentConns::new(config.agent_port);
        let agent_path = agents::agent_binary_path().map_err(internal)?;

        let agent_hosts = agents::restart_agents(
            self.runner.as_ref(),
            &conns,
            &agent_path,
            &config.agent_hosts(),
        )
        .await
        .map_err(internal)?;

        Ok(Response::new(RestartAgentsReply { agent_hosts }))
    }

    async fn stop_services(
        &self,
        _request: Request<StopServicesRequest>,
    ) -> Result<Response<StopServicesReply>, Status> {
        // No configuration yet means no agents to stop; the hub still obeys.
        if let Ok(config) = Config::load(&self.state_dir) {
            let conns = AgentConns::new(config.agent_port);
            agents::stop_agents(&conns, &config.agent_hosts())
                .await
                .map_err(internal)?;
        }

        self.shutdown.notify_one();
        Ok(Response::new(StopServicesReply {}))
    }

    async fn set_config(
        &self,
        request: Request<SetConfigRequest>,
    ) -> Result<Response<SetConfigReply>, Status> {
        let request = request.into_inner();

        let mut config = Config::load(&self.state_dir).map_err(internal)?;
        config.set(&request.name, &request.value).map_err(invalid)?;
        config.save(&self.state_dir).map_err(internal)?;

        Ok(Response::new(SetConfigReply {}))
    }

    async fn get_config(
        &self,
        request: Request<GetConfigRequest>,
    ) -> Result<Response<GetConfigReply>, Status> {
        let request = request.into_inner();

        let config = Config::load(&self.state_dir).map_err(internal)?;
        let value = config.get(&request.name).map_err(invalid)?;

        Ok(Response::new(GetConfigReply { value }))
    }
}
