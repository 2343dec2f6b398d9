use std::time::Duration;
use thiserror::Error;
use crate::job::{JobId, JobStatus};

/// Rejected before any network interaction; never enters the job lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please upload an image first")]
    MissingImage,
    #[error("Please enter a prompt")]
    EmptyPrompt,
}

/// A submission or status lookup that failed to complete.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Network, DNS, TLS or body decoding failure.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Generation service error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected response from generation service: {0}")]
    UnexpectedPayload(String),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A status update for a job that is no longer the active one.
///
/// Never surfaced to the user; the poller logs and drops it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("update for job {job_id} arrived after it was superseded")]
pub struct StaleUpdateError {
    pub job_id: JobId,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job is already {0} and can no longer change")]
    Frozen(JobStatus),
    #[error("cannot move a job backwards from {from} to {to}")]
    Backwards { from: JobStatus, to: JobStatus },
    #[error("a completed job must carry a result reference")]
    MissingResult,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("only submitted jobs with an id can be added to history")]
    MissingId,
    #[error("job {0} is already in history")]
    DuplicateId(JobId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("failed to load .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
}
