//! What a renderer shows for a given store snapshot.
//!
//! Pure functions of the snapshot, so two renders of the same revision are
//! always identical.

use reqwest::Url;
use crate::draft::DraftRequest;
use crate::generator::backend::config::BackendConfig;
use crate::job::{JobRecord, JobStatus};
use crate::store::StoreSnapshot;

pub const IDLE_MESSAGE: &str = "Generate an image to see the result here";
pub const UNKNOWN_ERROR_MESSAGE: &str = "An unknown error occurred";
pub const COMPLETE_MESSAGE: &str = "Image generation complete!";

/// Result panel for the active job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultView {
    Idle { message: String },
    InFlight { status: JobStatus, message: String },
    Failed { message: String },
    /// `url` is `None` when the service's locator cannot be resolved.
    Completed { url: Option<Url>, message: String },
}

impl ResultView {
    pub fn message(&self) -> &str {
        match self {
            ResultView::Idle { message }
            | ResultView::InFlight { message, .. }
            | ResultView::Failed { message }
            | ResultView::Completed { message, .. } => message,
        }
    }
}

pub fn result_view(snapshot: &StoreSnapshot, config: &BackendConfig) -> ResultView {
    let Some(job) = snapshot.active() else {
        return ResultView::Idle { message: IDLE_MESSAGE.to_string() };
    };

    match job.status {
        JobStatus::Idle => ResultView::Idle { message: IDLE_MESSAGE.to_string() },
        status @ (JobStatus::Uploading | JobStatus::Processing) => ResultView::InFlight {
            status,
            message: format!("Processing with {}...", job.preprocessor.id()),
        },
        JobStatus::Error => ResultView::Failed {
            message: job
                .error_detail
                .clone()
                .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string()),
        },
        JobStatus::Completed => ResultView::Completed {
            url: job
                .result_reference
                .as_deref()
                .and_then(|reference| config.resolve_result(reference)),
            message: COMPLETE_MESSAGE.to_string(),
        },
    }
}

/// Mirrors the generate button: needs an image and a prompt, and is
/// disabled while a submission is uploading.
pub fn submit_enabled(draft: &DraftRequest) -> bool {
    draft.validate().is_ok() && draft.status != JobStatus::Uploading
}

pub fn history_line(job: &JobRecord) -> String {
    let id = job.id.as_ref().map_or("-", |id| id.as_str());
    format!(
        "{} [{}] {} {:?} ({}, {})",
        job.status.icon(),
        id,
        job.preprocessor.id(),
        job.prompt,
        job.status,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}
