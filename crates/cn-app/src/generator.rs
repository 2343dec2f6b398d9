use std::sync::Arc;
use tracing::info;
use crate::draft::{DraftPatch, DraftRequest};
use crate::error::{SubmitError, TransportError};
use crate::generator::backend::config::BackendConfig;
use crate::generator::backend::{GenBackend, GenerationService};
use crate::generator::poller::StatusPoller;
use crate::generator::submit::{JobHandle, SubmissionController};
use crate::store::LifecycleStore;

pub mod backend;
pub mod poller;
pub mod submit;

/// Session entry point: one store, one backend, one submission controller.
pub struct Generator {
    backend: Arc<dyn GenerationService>,
    store: Arc<LifecycleStore>,
    controller: SubmissionController,
    config: BackendConfig,
}

impl Generator {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let backend = GenBackend::new(config.clone())?;
        Ok(Self::with_backend(Arc::new(backend), config))
    }

    pub fn with_backend(backend: Arc<dyn GenerationService>, config: BackendConfig) -> Self {
        let store = Arc::new(LifecycleStore::new());
        let poller = StatusPoller::new(backend.clone(), store.clone(), config.poll_config());
        let controller = SubmissionController::new(backend.clone(), store.clone(), poller);

        Self {
            backend,
            store,
            controller,
            config,
        }
    }

    pub fn store(&self) -> &Arc<LifecycleStore> {
        &self.store
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn update_draft(&self, patch: DraftPatch) -> bool {
        self.store.update_draft(patch)
    }

    /// Submit whatever the store's draft currently holds, consuming it on
    /// success.
    pub async fn submit_draft(&self) -> Result<JobHandle, SubmitError> {
        self.controller.submit_draft().await
    }

    /// Submit a draft that is not the store's; the store's draft is not
    /// touched.
    pub async fn submit(&self, draft: &DraftRequest) -> Result<JobHandle, SubmitError> {
        self.controller.submit(draft).await
    }

    pub fn cancel_active(&self) {
        self.controller.cancel_active();
    }

    /// Pull the service's recent generations into history. Returns how many
    /// records were new to this session.
    pub async fn refresh_history(&self) -> Result<usize, TransportError> {
        let generations = self.backend.history(self.config.history_limit).await?;
        let records = generations.into_iter().map(|g| g.into_record()).collect();

        let added = self.store.merge_history(records);
        info!(added, "Refreshed generation history");
        Ok(added)
    }

    pub fn shutdown(&self) {
        self.cancel_active();
    }
}
