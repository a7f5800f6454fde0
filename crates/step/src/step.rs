// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use camino::Utf8PathBuf;

use uplift_protocol::common::{self, Phase, Status, Substep};
use uplift_system::streams::OutStreams;
use uplift_types::ErrorList;

use crate::sender::MessageSender;
use crate::status::{FileStore, SubstepStore};
use crate::stream::MultiplexedStreams;

/// Returned from a substep action to mark the substep complete on disk while
/// reporting "skipped" to the operator. Not an error in any meaningful sense.
#[derive(Debug, thiserror::Error)]
#[error("skipped")]
pub struct Skip;

/// Reported when the operator abandons a phase before it starts.
#[derive(Debug, thiserror::Error)]
#[error("user cancelled")]
pub struct UserCancelled;

/// The sentinel failure injected by the resume-testing overlay.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, thiserror::Error)]
#[error("injected failure after successful substep")]
pub struct InjectedFailure;

/// Executes one phase as an ordered sequence of substeps.
///
/// The first substep error is latched: every later `run` call becomes a
/// no-op, and [`Step::finish`] surfaces the latched error. This keeps phase
/// definitions linear; no substep needs to check its predecessors.
pub struct Step {
    phase: Phase,
    sender: Arc<dyn MessageSender>,
    store: Box<dyn SubstepStore>,
    streams: MultiplexedStreams,
    err: Option<anyhow::Error>,
    #[cfg(any(test, feature = "test-util"))]
    inject_failures: bool,
}

impl Step {
    /// Opens the phase log, seeds the status document, and wires the
    /// multiplexed stream. The state directory must already exist.
    pub fn begin(
        state_dir: &Utf8PathBuf,
        phase: Phase,
        sender: Arc<dyn MessageSender>,
    ) -> anyhow::Result<Self> {
        let log_path = state_dir.join(format!("{}.log", phase.as_str_name().to_lowercase()));
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_path.as_std_path())
            .with_context(|| format!("opening phase log {log_path}"))?;

        writeln!(log, "\n{} in progress.", title(phase))
            .with_context(|| format!("writing phase log {log_path}"))?;

        let store = FileStore::new(state_dir);
        store.ensure_exists()?;

        let streams = MultiplexedStreams::new(Arc::clone(&sender), Box::new(log));

        Ok(Step {
            phase,
            sender,
            store: Box::new(store),
            streams,
            err: None,
            #[cfg(any(test, feature = "test-util"))]
            inject_failures: false,
        })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn with_store(
        phase: Phase,
        sender: Arc<dyn MessageSender>,
        store: Box<dyn SubstepStore>,
        streams: MultiplexedStreams,
    ) -> Self {
        Step {
            phase,
            sender,
            store,
            streams,
            err: None,
            inject_failures: false,
        }
    }

    /// Converts the outcome of every freshly run, successful substep into a
    /// sentinel failure after success has been persisted. Re-invoking the
    /// phase then exercises the skip-if-complete path one substep further.
    #[cfg(any(test, feature = "test-util"))]
    pub fn inject_failure_after_success(&mut self) {
        self.inject_failures = true;
    }

    pub fn streams(&self) -> Arc<dyn OutStreams> {
        Arc::new(self.streams.clone())
    }

    pub fn err(&self) -> Option<&anyhow::Error> {
        self.err.as_ref()
    }

    /// Runs a substep unless it already completed in a previous invocation.
    pub async fn run<F, Fut>(&mut self, substep: Substep, action: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_inner(substep, action, false).await
    }

    /// Runs a substep even when a previous invocation completed it.
    pub async fn always_run<F, Fut>(&mut self, substep: Substep, action: F)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_inner(substep, action, true).await
    }

    /// Runs hub-internal work that has no operator-visible status of its
    /// own. Errors latch exactly like substep errors.
    pub async fn run_internal<F, Fut>(&mut self, action: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.err.is_some() {
            return;
        }
        if let Err(err) = action().await {
            self.err = Some(err);
        }
    }

    /// Flushes the phase log and yields the latched error, if any.
    pub fn finish(mut self) -> anyhow::Result<()> {
        let flushed = self
            .streams
            .flush()
            .with_context(|| format!("closing phase log for {}", self.phase.as_str_name()));
        let latched = match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        ErrorList::combine(latched, flushed)
    }

    async fn run_inner<F, Fut>(&mut self, substep: Substep, action: F, always_run: bool)
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if self.err.is_some() {
            return;
        }
        if let Err(err) = self.execute(substep, action, always_run).await {
            self.err = Some(err.context(format!("substep {}", substep.as_str_name())));
        }
    }

    async fn execute<F, Fut>(
        &mut self,
        substep: Substep,
        action: F,
        always_run: bool,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(Arc<dyn OutStreams>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let status = self
            .store
            .read(self.phase, substep)?
            .map(|record| record.status);

        if status == Some(Status::Running) {
            // A previous process died mid-substep. The on-disk state cannot
            // be trusted, so require a human to look before rerunning.
            let message = format!(
                "Found previous substep {} was running. Manual intervention needed to cleanup.",
                substep.as_str_name()
            );
            self.send(common::Message::failed(substep, message.clone()));
            anyhow::bail!(message);
        }

        // Only rerun failed or pending substeps, unless declared always-run.
        if status == Some(Status::Complete) && !always_run {
            self.send(common::Message::status(substep, Status::Skipped));
            return Ok(());
        }

        let timer = Instant::now();
        let name = substep.as_str_name();

        writeln!(self.streams.stdout(), "\nStarting {name}...\n")
            .context("writing substep banner")?;

        self.persist_and_send(substep, Status::Running, None)?;

        let result = action(self.streams()).await;

        let outcome = match result {
            Err(err) if err.chain().any(|cause| cause.is::<Skip>()) => {
                self.persist_and_send(substep, Status::Skipped, None)
            }
            Err(err) => {
                let mut errs = ErrorList::new();
                let message = format!("{err:#}");
                errs.push(err);
                errs.extend_from(self.persist_and_send(substep, Status::Failed, Some(message)));
                errs.into_result()
            }
            Ok(()) => {
                let persisted = self.persist_and_send(substep, Status::Complete, None);
                #[cfg(any(test, feature = "test-util"))]
                let persisted = persisted.and_then(|()| {
                    if self.inject_failures {
                        Err(InjectedFailure.into())
                    } else {
                        Ok(())
                    }
                });
                persisted
            }
        };

        let elapsed = Duration::from_millis(timer.elapsed().as_millis() as u64);
        let printed = writeln!(
            self.streams.stdout(),
            "\n{name} took {}\n",
            humantime::format_duration(elapsed)
        )
        .context("writing substep duration");

        ErrorList::combine(outcome, printed)
    }

    /// Persists the transition and mirrors it to the operator. An explicit
    /// skip is stored as COMPLETE so a rerun does not repeat the work.
    fn persist_and_send(
        &self,
        substep: Substep,
        status: Status,
        error_message: Option<String>,
    ) -> anyhow::Result<()> {
        let stored = match status {
            Status::Skipped => Status::Complete,
            other => other,
        };
        self.store.write(self.phase, substep, stored)?;

        match error_message {
            Some(message) => self.send(common::Message::failed(substep, message)),
            None => self.send(common::Message::status(substep, status)),
        }
        Ok(())
    }

    fn send(&self, message: common::Message) {
        // The operator stream may be gone; the status document and phase log
        // remain authoritative.
        let _ = self.sender.send(message);
    }
}

fn title(phase: Phase) -> String {
    let lower = phase.as_str_name().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSender(Mutex<Vec<common::Message>>);

    impl RecordingSender {
        fn statuses(&self) -> Vec<(Substep, Status, String)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|message| match &message.contents {
                    Some(common::message::Contents::Status(status)) => Some((
                        status.substep(),
                        status.status(),
                        status.error_message.clone(),
                    )),
                    _ => None,
                })
                .collect()
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: common::Message) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        state_dir: Utf8PathBuf,
        sender: Arc<RecordingSender>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let state_dir = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).unwrap();
            Fixture {
                _tmp: tmp,
                state_dir,
                sender: Arc::new(RecordingSender::default()),
            }
        }

        fn step(&self, phase: Phase) -> Step {
            Step::begin(&self.state_dir, phase, self.sender.clone()).unwrap()
        }

        fn store(&self, phase: Phase) -> impl Fn(Substep) -> Option<Status> + '_ {
            move |substep| {
                FileStore::new(&self.state_dir)
                    .read(phase, substep)
                    .unwrap()
                    .map(|record| record.status)
            }
        }
    }

    #[tokio::test]
    async fn successful_substeps_run_in_order_and_persist() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Initialize);
        let order = Arc::new(Mutex::new(Vec::new()));

        let seen = order.clone();
        step.run(Substep::SaveSourceClusterConfig, |_| async move {
            seen.lock().unwrap().push("save");
            Ok(())
        })
        .await;
        let seen = order.clone();
        step.run(Substep::StartAgents, |_| async move {
            seen.lock().unwrap().push("agents");
            Ok(())
        })
        .await;

        step.finish().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["save", "agents"]);
        let status = fixture.store(Phase::Initialize);
        assert_eq!(status(Substep::SaveSourceClusterConfig), Some(Status::Complete));
        assert_eq!(status(Substep::StartAgents), Some(Status::Complete));
    }

    #[tokio::test]
    async fn errors_latch_and_skip_later_substeps() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Execute);
        let ran = Arc::new(AtomicUsize::new(0));

        step.run(Substep::UpgradeCoordinator, |_| async {
            anyhow::bail!("pg_upgrade exploded")
        })
        .await;
        let counter = ran.clone();
        step.run(Substep::UpgradePrimaries, |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        let err = step.finish().unwrap_err();
        assert!(err.to_string().contains("UPGRADE_COORDINATOR"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let status = fixture.store(Phase::Execute);
        assert_eq!(status(Substep::UpgradeCoordinator), Some(Status::Failed));
        assert_eq!(status(Substep::UpgradePrimaries), None);
    }

    #[tokio::test]
    async fn failed_frame_carries_the_error_message() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Execute);

        step.run(Substep::UpgradeCoordinator, |_| async {
            anyhow::bail!("boom")
        })
        .await;
        let _ = step.finish();

        let statuses = fixture.sender.statuses();
        let failed = statuses
            .iter()
            .find(|(_, status, _)| *status == Status::Failed)
            .unwrap();
        assert!(failed.2.contains("boom"));
    }

    #[tokio::test]
    async fn completed_substeps_are_skipped_on_rerun() {
        let fixture = Fixture::new();

        let mut step = fixture.step(Phase::Initialize);
        step.run(Substep::StartAgents, |_| async { Ok(()) }).await;
        step.finish().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let mut step = fixture.step(Phase::Initialize);
        let counter = ran.clone();
        step.run(Substep::StartAgents, |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        step.finish().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let last = fixture.sender.statuses().pop().unwrap();
        assert_eq!(last.1, Status::Skipped);
    }

    #[tokio::test]
    async fn always_run_reruns_completed_substeps() {
        let fixture = Fixture::new();

        let mut step = fixture.step(Phase::Revert);
        step.always_run(Substep::ShutdownTargetCluster, |_| async { Ok(()) })
            .await;
        step.finish().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let mut step = fixture.step(Phase::Revert);
        let counter = ran.clone();
        step.always_run(Substep::ShutdownTargetCluster, |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        step.finish().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_sentinel_completes_on_disk_but_reports_skipped() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Initialize);

        step.run(Substep::CheckDiskSpace, |_| async { Err(Skip.into()) })
            .await;
        step.finish().unwrap();

        let status = fixture.store(Phase::Initialize);
        assert_eq!(status(Substep::CheckDiskSpace), Some(Status::Complete));

        let last = fixture.sender.statuses().pop().unwrap();
        assert_eq!(last.1, Status::Skipped);
    }

    #[tokio::test]
    async fn a_substep_found_running_demands_intervention() {
        let fixture = Fixture::new();
        FileStore::new(&fixture.state_dir).ensure_exists().unwrap();
        FileStore::new(&fixture.state_dir)
            .write(Phase::Execute, Substep::UpgradePrimaries, Status::Running)
            .unwrap();

        let mut step = fixture.step(Phase::Execute);
        step.run(Substep::UpgradePrimaries, |_| async { Ok(()) }).await;

        let err = step.finish().unwrap_err();
        assert!(err.to_string().contains("Manual intervention"));
    }

    #[tokio::test]
    async fn run_internal_latches_errors_without_status_frames() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Initialize);

        step.run_internal(|| async { anyhow::bail!("no can do") }).await;
        step.run(Substep::StartAgents, |_| async { Ok(()) }).await;

        assert!(step.finish().is_err());
        assert!(fixture.sender.statuses().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_exercise_the_resume_path() {
        let fixture = Fixture::new();

        let mut step = fixture.step(Phase::Initialize);
        step.inject_failure_after_success();
        step.run(Substep::SaveSourceClusterConfig, |_| async { Ok(()) })
            .await;
        step.run(Substep::StartAgents, |_| async { Ok(()) }).await;

        let err = step.finish().unwrap_err();
        assert!(err.chain().any(|cause| cause.is::<InjectedFailure>()));

        // Success was persisted before the sentinel fired, so the rerun
        // skips ahead.
        let status = fixture.store(Phase::Initialize);
        assert_eq!(status(Substep::SaveSourceClusterConfig), Some(Status::Complete));
        assert_eq!(status(Substep::StartAgents), None);
    }

    #[tokio::test]
    async fn phase_log_collects_banners_across_substeps() {
        let fixture = Fixture::new();
        let mut step = fixture.step(Phase::Initialize);

        step.run(Substep::StartAgents, |streams| async move {
            writeln!(streams.stdout(), "agent output")?;
            Ok(())
        })
        .await;
        step.finish().unwrap();

        let log = std::fs::read_to_string(fixture.state_dir.join("initialize.log")).unwrap();
        assert!(log.contains("Initialize in progress."));
        assert!(log.contains("Starting START_AGENTS..."));
        assert!(log.contains("agent output"));
        assert!(log.contains("START_AGENTS took"));
    }
}
