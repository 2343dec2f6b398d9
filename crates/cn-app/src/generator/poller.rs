//! Status poller for the active job.
//!
//! [`StatusPoller::start`] spawns one task per job that looks the job up on
//! a fixed interval until it reaches a terminal status. Every response is
//! applied through [`LifecycleStore::patch_active`], so a poller that has
//! been cancelled or superseded can never write into the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::error::TransportError;
use crate::generator::backend::GenerationService;
use crate::job::{JobId, JobPatch, JobStatus};
use crate::store::{LifecycleStore, PatchOutcome};

pub const TRANSPORT_FAILURE_DETAIL: &str = "Error checking generation status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            max_attempts: Some(200),
        }
    }
}

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    Terminal(JobStatus),
    Cancelled,
    /// Another job became active.
    Superseded,
    TransportFailed,
    AttemptsExhausted,
    /// The job was already terminal when the poller looked at it.
    AlreadyTerminal,
    UnknownJob,
}

#[derive(Clone)]
pub struct StatusPoller {
    service: Arc<dyn GenerationService>,
    store: Arc<LifecycleStore>,
    config: PollConfig,
}

impl StatusPoller {
    pub fn new(service: Arc<dyn GenerationService>, store: Arc<LifecycleStore>, config: PollConfig) -> Self {
        Self { service, store, config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `job_id`. Returns an already-finished handle without
    /// spawning anything if the job is unknown, terminal or not active.
    pub fn start(&self, job_id: JobId) -> PollHandle {
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = PollHandle {
            job_id: job_id.clone(),
            cancel: cancel.clone(),
            exit: exit_rx,
        };

        if let Some(exit) = check_pollable(&self.store, &job_id) {
            debug!(job_id = %job_id, ?exit, "Not starting poller");
            exit_tx.send_replace(Some(exit));
            return handle;
        }

        let run = PollRun {
            service: self.service.clone(),
            store: self.store.clone(),
            config: self.config,
            job_id,
            cancel,
        };

        tokio::spawn(async move {
            let exit = run.run().await;
            exit_tx.send_replace(Some(exit));
        });

        handle
    }
}

/// Handle to a running poller. Cloning shares the same task.
#[derive(Debug, Clone)]
pub struct PollHandle {
    job_id: JobId,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<PollExit>>,
}

impl PollHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Idempotent; safe on a finished or already-cancelled poller.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!(job_id = %self.job_id, "Cancelling poller");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn exit(&self) -> Option<PollExit> {
        *self.exit.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.exit().is_some()
    }

    pub async fn finished(&self) -> PollExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => (*exit).unwrap_or(PollExit::Cancelled),
            // Task dropped without reporting, e.g. runtime shutdown.
            Err(_) => PollExit::Cancelled,
        }
    }
}

fn check_pollable(store: &LifecycleStore, job_id: &JobId) -> Option<PollExit> {
    let snapshot = store.snapshot();
    let Some(job) = snapshot.job(job_id) else {
        return Some(PollExit::UnknownJob);
    };
    if !job.status.is_in_flight() {
        return Some(PollExit::AlreadyTerminal);
    }
    if snapshot.active_id.as_ref() != Some(job_id) {
        return Some(PollExit::Superseded);
    }
    None
}

struct PollRun {
    service: Arc<dyn GenerationService>,
    store: Arc<LifecycleStore>,
    config: PollConfig,
    job_id: JobId,
    cancel: CancellationToken,
}

impl PollRun {
    async fn run(self) -> PollExit {
        let mut attempts = 0u32;

        loop {
            if let Some(exit) = check_pollable(&self.store, &self.job_id) {
                return exit;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return PollExit::Cancelled,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            attempts += 1;
            debug!(job_id = %self.job_id, attempts, "Polling generation status");

            let response = tokio::select! {
                _ = self.cancel.cancelled() => return PollExit::Cancelled,
                response = tokio::time::timeout(
                    self.config.request_timeout,
                    self.service.fetch(&self.job_id),
                ) => response,
            };

            if self.cancel.is_cancelled() {
                debug!(job_id = %self.job_id, "Discarding response for cancelled poller");
                return PollExit::Cancelled;
            }

            let generation = match response {
                Ok(Ok(generation)) => generation,
                Ok(Err(e)) => return self.transport_failed(e),
                Err(_) => return self.transport_failed(TransportError::Timeout(self.config.request_timeout)),
            };

            let patch = generation.to_patch();
            match self.store.patch_active(&self.job_id, &patch) {
                Err(stale) => {
                    debug!("{}", stale);
                    return PollExit::Superseded;
                }
                Ok(PatchOutcome::UnknownJob) => return PollExit::UnknownJob,
                Ok(PatchOutcome::Rejected(e)) => {
                    warn!(job_id = %self.job_id, "Ignoring status update: {}", e);
                }
                Ok(PatchOutcome::Applied | PatchOutcome::Unchanged) => {}
            }

            if let Some(status) = patch.status.filter(JobStatus::is_terminal) {
                info!(job_id = %self.job_id, %status, attempts, "Generation finished");
                return PollExit::Terminal(status);
            }

            if let Some(max) = self.config.max_attempts.filter(|max| attempts >= *max) {
                warn!(job_id = %self.job_id, attempts, "Giving up on generation");
                let detail = format!("Generation timed out after {max} status checks");
                return self.fail(detail, PollExit::AttemptsExhausted);
            }
        }
    }

    fn transport_failed(&self, error: TransportError) -> PollExit {
        warn!(job_id = %self.job_id, "Status lookup failed: {}", error);
        self.fail(TRANSPORT_FAILURE_DETAIL.to_string(), PollExit::TransportFailed)
    }

    fn fail(&self, detail: String, exit: PollExit) -> PollExit {
        match self.store.patch_active(&self.job_id, &JobPatch::failed(detail)) {
            Ok(_) => exit,
            Err(stale) => {
                debug!("{}", stale);
                PollExit::Superseded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cn_core::Preprocessor;
    use crate::generator::backend::fake::{self, ScriptedService};
    use crate::job::JobRecord;

    fn quick() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(5),
            request_timeout: Duration::from_secs(1),
            max_attempts: None,
        }
    }

    fn record(id: &str, status: JobStatus) -> JobRecord {
        JobRecord {
            id: Some(JobId::new(id)),
            status,
            prompt: "a cat in armor".into(),
            preprocessor: Preprocessor::Pose,
            result_reference: None,
            error_detail: None,
            created_at: Utc::now(),
        }
    }

    fn setup(config: PollConfig) -> (Arc<ScriptedService>, Arc<LifecycleStore>, StatusPoller) {
        let service = Arc::new(ScriptedService::default());
        let store = Arc::new(LifecycleStore::new());
        store.append(record("J1", JobStatus::Uploading)).unwrap();
        let poller = StatusPoller::new(service.clone(), store.clone(), config);
        (service, store, poller)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn status_of(store: &LifecycleStore, id: &str) -> JobStatus {
        store.job(&JobId::new(id)).unwrap().status
    }

    #[tokio::test]
    async fn processing_update_keeps_polling() {
        let (service, store, poller) = setup(quick());
        service.respond("J1", Ok(fake::generation("J1", JobStatus::Processing)));
        let _release = service.gate("J1");

        let handle = poller.start(JobId::new("J1"));
        eventually(|| service.fetch_count("J1") == 2).await;

        assert_eq!(status_of(&store, "J1"), JobStatus::Processing);
        assert!(!handle.is_finished());
        handle.cancel();
    }

    #[tokio::test]
    async fn completed_stops_polling() {
        let (service, store, poller) = setup(quick());
        service.respond("J1", Ok(fake::generation("J1", JobStatus::Processing)));
        service.respond("J1", Ok(fake::completed("J1", "/out/42.png")));

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.finished().await, PollExit::Terminal(JobStatus::Completed));

        let job = store.job(&JobId::new("J1")).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_reference.as_deref(), Some("/out/42.png"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.fetch_count("J1"), 2);
    }

    #[tokio::test]
    async fn error_status_records_detail() {
        let (service, store, poller) = setup(quick());
        service.respond("J1", Ok(fake::failed("J1", "model failure")));

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.finished().await, PollExit::Terminal(JobStatus::Error));

        let job = store.job(&JobId::new("J1")).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_detail.as_deref(), Some("model failure"));
        assert_eq!(service.fetch_count("J1"), 1);
    }

    #[tokio::test]
    async fn transport_fault_fails_the_job_without_retry() {
        let (service, store, poller) = setup(quick());
        service.respond("J1", Err(fake::unavailable()));

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.finished().await, PollExit::TransportFailed);

        let job = store.job(&JobId::new("J1")).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_detail.as_deref(), Some(TRANSPORT_FAILURE_DETAIL));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.fetch_count("J1"), 1);
    }

    #[tokio::test]
    async fn hung_request_times_out() {
        let config = PollConfig { request_timeout: Duration::from_millis(20), ..quick() };
        let (_service, store, poller) = setup(config);

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.finished().await, PollExit::TransportFailed);
        assert_eq!(status_of(&store, "J1"), JobStatus::Error);
    }

    #[tokio::test]
    async fn attempt_cap_fails_the_job() {
        let config = PollConfig { max_attempts: Some(2), ..quick() };
        let (service, store, poller) = setup(config);
        service.respond("J1", Ok(fake::generation("J1", JobStatus::Processing)));
        service.respond("J1", Ok(fake::generation("J1", JobStatus::Processing)));

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.finished().await, PollExit::AttemptsExhausted);

        let job = store.job(&JobId::new("J1")).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            job.error_detail.as_deref(),
            Some("Generation timed out after 2 status checks")
        );
    }

    #[tokio::test]
    async fn terminal_job_is_not_polled() {
        let (service, store, poller) = setup(quick());
        store.patch(&JobId::new("J1"), &JobPatch::completed("/out/1.png"));

        let handle = poller.start(JobId::new("J1"));
        assert_eq!(handle.exit(), Some(PollExit::AlreadyTerminal));
        assert_eq!(handle.finished().await, PollExit::AlreadyTerminal);
        assert_eq!(service.fetch_count("J1"), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_polled() {
        let (service, _store, poller) = setup(quick());

        let handle = poller.start(JobId::new("nope"));
        assert_eq!(handle.finished().await, PollExit::UnknownJob);
        assert_eq!(service.fetch_count("nope"), 0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (service, store, poller) = setup(quick());
        let _release = service.gate("J1");
        let revision = store.snapshot().revision;

        let handle = poller.start(JobId::new("J1"));
        handle.cancel();
        handle.cancel();

        assert_eq!(handle.finished().await, PollExit::Cancelled);
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(store.snapshot().revision, revision);
        assert_eq!(status_of(&store, "J1"), JobStatus::Uploading);
    }

    #[tokio::test]
    async fn response_after_cancel_is_discarded() {
        let (service, store, poller) = setup(quick());
        let release = service.gate("J1");

        let handle = poller.start(JobId::new("J1"));
        eventually(|| service.fetch_count("J1") == 1).await;

        handle.cancel();
        let _ = release.send(Ok(fake::completed("J1", "/out/late.png")));

        assert_eq!(handle.finished().await, PollExit::Cancelled);
        let job = store.job(&JobId::new("J1")).unwrap();
        assert_eq!(job.status, JobStatus::Uploading);
        assert_eq!(job.result_reference, None);
    }

    #[tokio::test]
    async fn superseded_poll_never_touches_new_job() {
        let (service, store, poller) = setup(quick());
        let release = service.gate("J1");

        let handle = poller.start(JobId::new("J1"));
        eventually(|| service.fetch_count("J1") == 1).await;

        store.append(record("J2", JobStatus::Uploading)).unwrap();
        let _ = release.send(Ok(fake::completed("J1", "/out/1.png")));

        assert_eq!(handle.finished().await, PollExit::Superseded);
        assert_eq!(status_of(&store, "J1"), JobStatus::Uploading);
        assert_eq!(status_of(&store, "J2"), JobStatus::Uploading);
    }
}
