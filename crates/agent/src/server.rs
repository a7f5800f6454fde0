// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The agent gRPC service. Every method is idempotent so the hub can rerun
//! a failed substep without special casing; most of them delegate to the
//! host-level primitives in `uplift_system`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use uplift_protocol::agent::agent_server::{Agent, AgentServer};
use uplift_protocol::agent::*;
use uplift_system::conf::{self, ConfEdit};
use uplift_system::{fs, paths, tablespaces, CommandRunner, DevNullStreams, LocalRunner};
use uplift_types::ErrorList;

use crate::replication;
use crate::rsync;
use crate::upgrade;

pub struct AgentOptions {
    pub port: u16,
    /// Print the readiness line a daemonizing parent waits for.
    pub daemonize: bool,
}

pub struct AgentService {
    runner: Arc<dyn CommandRunner>,
    state_dir: Utf8PathBuf,
    shutdown: Arc<Notify>,
}

impl AgentService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        state_dir: Utf8PathBuf,
        shutdown: Arc<Notify>,
    ) -> Self {
        AgentService {
            runner,
            state_dir,
            shutdown,
        }
    }
}

/// Binds the agent listener and serves until `StopAgent` arrives. The state
/// directory is created up front so a fresh host is usable without any
/// manual preparation.
pub async fn serve(options: AgentOptions) -> anyhow::Result<()> {
    let state_dir = paths::state_dir();
    paths::ensure_state_dir(&state_dir)?;

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, options.port).into();
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;

    if options.daemonize {
        // The parent process blocks on this exact line before detaching.
        println!(
            "Agent started on port {} (pid {})",
            local.port(),
            std::process::id()
        );
    }
    info!(address = %local, "agent listening");

    let shutdown = Arc::new(Notify::new());
    let service = AgentService::new(Arc::new(LocalRunner), state_dir, shutdown.clone());

    Server::builder()
        .add_service(AgentServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.notified().await;
            info!("agent shutting down");
        })
        .await?;
    Ok(())
}

fn internal(err: anyhow::Error) -> Status {
    Status::internal(format!("{err:#}"))
}

fn utf8_paths(paths: &[String]) -> Vec<Utf8PathBuf> {
    paths.iter().map(Utf8PathBuf::from).collect()
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn create_segment_data_directories(
        &self,
        request: Request<CreateSegmentDataDirectoriesRequest>,
    ) -> Result<Response<CreateSegmentDataDirectoriesReply>, Status> {
        info!("creating segment data directories");

        let mut errs = ErrorList::new();
        for datadir in &request.into_inner().datadirs {
            if let Err(err) = fs::create_data_directory(Utf8Path::new(datadir)) {
                errs.push(err);
            }
        }
        errs.into_result().map_err(internal)?;
        Ok(Response::new(CreateSegmentDataDirectoriesReply {}))
    }

    async fn delete_directories(
        &self,
        request: Request<DeleteDirectoriesRequest>,
    ) -> Result<Response<DeleteDirectoriesReply>, Status> {
        info!("deleting directories");

        let directories = utf8_paths(&request.into_inner().directories);
        fs::delete_directories(&directories, &[], &DevNullStreams).map_err(internal)?;
        Ok(Response::new(DeleteDirectoriesReply {}))
    }

    async fn delete_data_directories(
        &self,
        request: Request<DeleteDataDirectoriesRequest>,
    ) -> Result<Response<DeleteDataDirectoriesReply>, Status> {
        info!("deleting data directories");

        let datadirs = utf8_paths(&request.into_inner().datadirs);
        fs::delete_directories(&datadirs, fs::POSTGRES_FILES, &DevNullStreams)
            .map_err(internal)?;
        Ok(Response::new(DeleteDataDirectoriesReply {}))
    }

    async fn delete_state_directory(
        &self,
        _request: Request<DeleteStateDirectoryRequest>,
    ) -> Result<Response<DeleteStateDirectoryReply>, Status> {
        info!("deleting state directory");

        fs::delete_directories(
            &[self.state_dir.clone()],
            fs::STATE_DIRECTORY_FILES,
            &DevNullStreams,
        )
        .map_err(internal)?;
        Ok(Response::new(DeleteStateDirectoryReply {}))
    }

    async fn delete_tablespace_directories(
        &self,
        request: Request<DeleteTablespaceDirectoriesRequest>,
    ) -> Result<Response<DeleteTablespaceDirectoriesReply>, Status> {
        info!("deleting tablespace directories");

        let dirs = utf8_paths(&request.into_inner().dirs);
        tablespaces::delete_tablespace_directories(&dirs, &DevNullStreams)
            .map_err(internal)?;
        Ok(Response::new(DeleteTablespaceDirectoriesReply {}))
    }

    async fn rename_directories(
        &self,
        request: Request<RenameDirectoriesRequest>,
    ) -> Result<Response<RenameDirectoriesReply>, Status> {
        info!("renaming data directories");

        let mut errs = ErrorList::new();
        for pair in &request.into_inner().dirs {
            if let Err(err) = fs::archive_source(
                Utf8Path::new(&pair.source),
                Utf8Path::new(&pair.target),
                pair.rename_target,
            ) {
                errs.push(err);
            }
        }
        errs.into_result().map_err(internal)?;
        Ok(Response::new(RenameDirectoriesReply {}))
    }

    async fn rename_tablespaces(
        &self,
        request: Request<RenameTablespacesRequest>,
    ) -> Result<Response<RenameTablespacesReply>, Status> {
        info!("renaming tablespace directories");

        let hostname = fs::hostname();
        let mut errs = ErrorList::new();
        for pair in &request.into_inner().pairs {
            let source = Utf8Path::new(&pair.source);
            let target = Utf8Path::new(&pair.target);
            debug!(%source, %target, "renaming tablespace directory");

            if let Err(err) = rename_tablespace(source, target) {
                errs.push(err.context(format!("on host {hostname:?}")));
            }
        }
        errs.into_result().map_err(internal)?;
        Ok(Response::new(RenameTablespacesReply {}))
    }

    async fn check_disk_space(
        &self,
        request: Request<CheckDiskSpaceRequest>,
    ) -> Result<Response<CheckDiskSpaceReply>, Status> {
        info!("checking disk space");

        let request = request.into_inner();
        let datadirs = utf8_paths(&request.datadirs);
        let failed = uplift_system::disk::check_usage(request.free_ratio, &datadirs)
            .map_err(internal)?;

        Ok(Response::new(CheckDiskSpaceReply {
            failed: failed
                .into_iter()
                .map(|usage| FilesystemUsage {
                    fs: usage.fs.into_string(),
                    host: usage.host,
                    available: usage.available_bytes,
                    required: usage.required_bytes,
                })
                .collect(),
        }))
    }

    async fn rsync_data_directories(
        &self,
        request: Request<RsyncRequest>,
    ) -> Result<Response<RsyncReply>, Status> {
        info!("rsyncing data directories");

        let request = request.into_inner();

        // Refuse to ship anything that does not look like a data directory.
        let mut errs = ErrorList::new();
        for pair in &request.pairs {
            if let Err(err) = fs::verify_data_directory(Utf8Path::new(&pair.source)) {
                errs.push(err);
            }
        }
        errs.into_result().map_err(internal)?;

        rsync::run_pairs(self.runner.as_ref(), &request)
            .await
            .map_err(internal)?;
        Ok(Response::new(RsyncReply {}))
    }

    async fn rsync_tablespace_directories(
        &self,
        request: Request<RsyncRequest>,
    ) -> Result<Response<RsyncReply>, Status> {
        info!("rsyncing tablespace directories");

        let request = request.into_inner();

        let sources: Vec<Utf8PathBuf> = request
            .pairs
            .iter()
            .map(|pair| Utf8PathBuf::from(&pair.source))
            .collect();
        tablespaces::verify_tablespace_locations(&sources).map_err(internal)?;

        rsync::run_pairs(self.runner.as_ref(), &request)
            .await
            .map_err(internal)?;
        Ok(Response::new(RsyncReply {}))
    }

    async fn upgrade_primaries(
        &self,
        request: Request<UpgradePrimariesRequest>,
    ) -> Result<Response<UpgradePrimariesReply>, Status> {
        let request = request.into_inner();
        let action = if request.check_only { "check" } else { "upgrade" };
        info!(action, "upgrading primaries");

        upgrade::upgrade_primaries(self.runner.as_ref(), &self.state_dir, &request)
            .await
            .map_err(internal)?;
        Ok(Response::new(UpgradePrimariesReply {}))
    }

    async fn add_replication_entries(
        &self,
        request: Request<AddReplicationEntriesRequest>,
    ) -> Result<Response<AddReplicationEntriesReply>, Status> {
        info!("adding replication entries to pg_hba.conf");

        replication::add_replication_entries(&request.into_inner().entries)
            .map_err(internal)?;
        Ok(Response::new(AddReplicationEntriesReply {}))
    }

    async fn create_recovery_conf(
        &self,
        request: Request<CreateRecoveryConfRequest>,
    ) -> Result<Response<CreateRecoveryConfReply>, Status> {
        info!("writing mirror recovery configuration");

        replication::create_recovery_conf(&request.into_inner().infos).map_err(internal)?;
        Ok(Response::new(CreateRecoveryConfReply {}))
    }

    async fn restore_primaries_pg_control(
        &self,
        request: Request<RestorePrimariesPgControlRequest>,
    ) -> Result<Response<RestorePrimariesPgControlReply>, Status> {
        info!("restoring pg_control on primaries");

        let mut errs = ErrorList::new();
        for datadir in &request.into_inner().datadirs {
            if let Err(err) = fs::restore_pg_control(Utf8Path::new(datadir)) {
                errs.push(err);
            }
        }
        errs.into_result().map_err(internal)?;
        Ok(Response::new(RestorePrimariesPgControlReply {}))
    }

    async fn update_configuration(
        &self,
        request: Request<UpdateConfigurationRequest>,
    ) -> Result<Response<UpdateConfigurationReply>, Status> {
        info!("updating configuration files");

        let edits: Vec<ConfEdit> = request
            .into_inner()
            .edits
            .into_iter()
            .map(|edit| ConfEdit {
                path: edit.path,
                pattern: edit.pattern,
                replacement: edit.replacement,
            })
            .collect();
        conf::apply_edits(self.runner.as_ref(), &edits)
            .await
            .map_err(internal)?;
        Ok(Response::new(UpdateConfigurationReply {}))
    }

    async fn archive_log_directory(
        &self,
        request: Request<ArchiveLogDirectoryRequest>,
    ) -> Result<Response<ArchiveLogDirectoryReply>, Status> {
        info!("archiving log directory");

        let log_dir = paths::log_dir();
        let target = request.into_inner().log_dir;
        match std::fs::rename(log_dir.as_std_path(), &target) {
            Ok(()) => {}
            // Nothing was ever logged on this host; common on hosts that
            // only carry mirrors.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%log_dir, "log directory not archived: {err}");
            }
            Err(err) => {
                return Err(internal(
                    anyhow::Error::new(err)
                        .context(format!("archiving {log_dir} to {target}")),
                ));
            }
        }
        Ok(Response::new(ArchiveLogDirectoryReply {}))
    }

    async fn stop_agent(
        &self,
        _request: Request<StopAgentRequest>,
    ) -> Result<Response<StopAgentReply>, Status> {
        info!("stopping agent");

        // Graceful shutdown lets this reply reach the hub first.
        self.shutdown.notify_one();
        Ok(Response::new(StopAgentReply {}))
    }
}

fn rename_tablespace(source: &Utf8Path, target: &Utf8Path) -> anyhow::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent.as_std_path())
            .map_err(|err| anyhow::Error::new(err).context(format!("creating {parent}")))?;
    }
    std::fs::rename(source.as_std_path(), target.as_std_path())
        .map_err(|err| anyhow::Error::new(err).context(format!("renaming {source} to {target}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uplift_system::testing::ScriptedRunner;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    fn service(state_dir: Utf8PathBuf) -> (Arc<ScriptedRunner>, AgentService) {
        let runner = Arc::new(ScriptedRunner::new());
        let service = AgentService::new(runner.clone(), state_dir, Arc::new(Notify::new()));
        (runner, service)
    }

    fn make_data_dir(root: &Utf8Path, name: &str) -> Utf8PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for file in fs::POSTGRES_FILES {
            std::fs::write(dir.join(file), b"").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn create_segment_data_directories_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (_, service) = service(root.join("state"));

        let request = CreateSegmentDataDirectoriesRequest {
            datadirs: vec![
                root.join("primaries_upgrade/seg0").into_string(),
                root.join("primaries_upgrade/seg1").into_string(),
            ],
        };

        service
            .create_segment_data_directories(Request::new(request.clone()))
            .await
            .unwrap();
        service
            .create_segment_data_directories(Request::new(request))
            .await
            .unwrap();

        assert!(root.join("primaries_upgrade/seg0").is_dir());
        assert!(root.join("primaries_upgrade/seg1").is_dir());
    }

    #[tokio::test]
    async fn delete_data_directories_refuses_non_postgres_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (_, service) = service(root.join("state"));

        let stray = root.join("stray");
        std::fs::create_dir_all(&stray).unwrap();

        let err = service
            .delete_data_directories(Request::new(DeleteDataDirectoriesRequest {
                datadirs: vec![stray.clone().into_string()],
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(stray.is_dir());
    }

    #[tokio::test]
    async fn rename_directories_swaps_the_upgrade_copy_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (_, service) = service(root.join("state"));

        let source = make_data_dir(&root, "seg1");
        let target = make_data_dir(&root, "seg1_target");

        service
            .rename_directories(Request::new(RenameDirectoriesRequest {
                dirs: vec![RenamePair {
                    source: source.clone().into_string(),
                    target: target.clone().into_string(),
                    rename_target: true,
                }],
            }))
            .await
            .unwrap();

        assert!(root.join("seg1_old").is_dir());
        assert!(source.join("PG_VERSION").exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn rename_tablespaces_creates_missing_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (_, service) = service(root.join("state"));

        let source = root.join("fs/16385/1");
        std::fs::create_dir_all(&source).unwrap();
        let target = root.join("fs_old/16385/1");

        service
            .rename_tablespaces(Request::new(RenameTablespacesRequest {
                pairs: vec![TablespaceRenamePair {
                    source: source.clone().into_string(),
                    target: target.clone().into_string(),
                }],
            }))
            .await
            .unwrap();

        assert!(!source.exists());
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn rsync_data_directories_verifies_sources_before_running_anything() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (runner, service) = service(root.join("state"));

        let err = service
            .rsync_data_directories(Request::new(RsyncRequest {
                pairs: vec![RsyncPair {
                    source: root.join("not-a-datadir").into_string(),
                    destination_host: "sdw1".into(),
                    destination: "/data/copies".into(),
                }],
                options: vec!["--archive".into()],
                excluded_files: vec![],
            }))
            .await
            .unwrap_err();

        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn rsync_data_directories_ships_each_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (runner, service) = service(root.join("state"));

        let seg0 = make_data_dir(&root, "seg0");
        let seg1 = make_data_dir(&root, "seg1");

        service
            .rsync_data_directories(Request::new(RsyncRequest {
                pairs: vec![
                    RsyncPair {
                        source: seg0.into_string(),
                        destination_host: "sdw1".into(),
                        destination: "/data/copies".into(),
                    },
                    RsyncPair {
                        source: seg1.into_string(),
                        destination_host: String::new(),
                        destination: root.join("local").into_string(),
                    },
                ],
                options: vec!["--archive".into(), "--delete".into()],
                excluded_files: vec!["pg_log".into()],
            }))
            .await
            .unwrap();

        let calls = runner.calls_of("rsync");
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .any(|call| call.args.iter().any(|arg| arg == "sdw1:/data/copies")));
        assert!(calls
            .iter()
            .all(|call| call.args.iter().any(|arg| arg == "--exclude=pg_log")));
    }

    #[tokio::test]
    async fn update_configuration_rewrites_each_file_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let (runner, service) = service(root.join("state"));

        service
            .update_configuration(Request::new(UpdateConfigurationRequest {
                edits: vec![ConfFileEdit {
                    path: root.join("seg1/postgresql.conf").into_string(),
                    pattern: r"(^port[ \t]*=[ \t]*)6001([^0-9]|$)".into(),
                    replacement: r"\150433\2".into(),
                }],
            }))
            .await
            .unwrap();

        let calls = runner.calls_of("sed");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "-E");
        assert_eq!(calls[0].args[1], "-i.bak");
    }

    #[tokio::test]
    async fn stop_agent_triggers_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let root = utf8(tmp.path());
        let shutdown = Arc::new(Notify::new());
        let service = AgentService::new(
            Arc::new(ScriptedRunner::new()),
            root.join("state"),
            shutdown.clone(),
        );

        let notified = shutdown.notified();
        tokio::pin!(notified);

        service
            .stop_agent(Request::new(StopAgentRequest {}))
            .await
            .unwrap();

        notified.await;
    }
}
