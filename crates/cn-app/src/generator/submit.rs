use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use crate::draft::{DraftPatch, DraftRequest};
use crate::error::{SubmitError, TransportError};
use crate::generator::backend::GenerationService;
use crate::generator::backend::schemas::{GenerationResponse, SubmitRequest};
use crate::generator::poller::{PollExit, PollHandle, StatusPoller};
use crate::job::JobId;
use crate::store::LifecycleStore;

/// A submitted job and its poller.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    poll: PollHandle,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn poll(&self) -> &PollHandle {
        &self.poll
    }

    pub fn cancel(&self) {
        self.poll.cancel();
    }

    pub async fn finished(&self) -> PollExit {
        self.poll.finished().await
    }
}

/// Validates a draft, submits it and hands the new job to a poller.
///
/// At most one poller runs per controller: once a new record is active, the
/// previous job's poller is cancelled.
pub struct SubmissionController {
    service: Arc<dyn GenerationService>,
    store: Arc<LifecycleStore>,
    poller: StatusPoller,
    active: Mutex<Option<PollHandle>>,
}

impl SubmissionController {
    pub fn new(service: Arc<dyn GenerationService>, store: Arc<LifecycleStore>, poller: StatusPoller) -> Self {
        Self {
            service,
            store,
            poller,
            active: Mutex::new(None),
        }
    }

    /// Submit `draft` as given. The store's draft is left alone.
    pub async fn submit(&self, draft: &DraftRequest) -> Result<JobHandle, SubmitError> {
        self.run(draft, false).await
    }

    /// Submit the store's draft, reflecting progress on it: `uploading`
    /// until the service answers, `error` with the reason on failure, and a
    /// fresh draft once the job is tracked.
    pub async fn submit_draft(&self) -> Result<JobHandle, SubmitError> {
        let draft = self.store.draft();
        self.run(&draft, true).await
    }

    async fn run(&self, draft: &DraftRequest, owns_draft: bool) -> Result<JobHandle, SubmitError> {
        let request = SubmitRequest {
            image: draft.validate()?.clone(),
            prompt: draft.prompt.clone(),
            preprocessor: draft.preprocessor,
        };

        if owns_draft {
            self.store.update_draft(DraftPatch::uploading());
        }

        let generation = match self.send(request).await {
            Ok(generation) => generation,
            Err(e) => return Err(self.fail(e, owns_draft)),
        };

        let id = generation.id.clone();

        // A history refresh may already hold this id; `append` adopts it.
        // Anything else means the service reused an id.
        if let Err(e) = self.store.append(generation.into_record()) {
            return Err(self.fail(TransportError::UnexpectedPayload(e.to_string()), owns_draft));
        }

        self.cancel_active();
        if owns_draft {
            self.store.create_draft();
        }

        info!(job_id = %id, "Job submitted");

        let poll = self.poller.start(id.clone());
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(poll.clone());

        Ok(JobHandle { id, poll })
    }

    /// Cancel the current job's poller, if any. The record keeps its last
    /// known status.
    pub fn cancel_active(&self) {
        if let Some(poll) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            poll.cancel();
        }
    }

    async fn send(&self, request: SubmitRequest) -> Result<GenerationResponse, TransportError> {
        let created = self.service.submit(request).await?;
        self.service.fetch(&created.id).await
    }

    fn fail(&self, error: TransportError, owns_draft: bool) -> SubmitError {
        warn!("Submission failed: {}", error);
        if owns_draft {
            self.store.update_draft(DraftPatch::failed(error.to_string()));
        }
        error.into()
    }
}
