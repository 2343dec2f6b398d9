use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use cn_core::Preprocessor;
use crate::error::TransitionError;

/// Opaque job identifier assigned by the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    #[serde(alias = "pending", alias = "queued")]
    Uploading,
    Processing,
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl JobStatus {
    /// Still subject to polling.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Uploading | Self::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Uploading => 1,
            Self::Processing => 2,
            Self::Completed | Self::Error => 3,
        }
    }

    /// Forward-only: `uploading -> processing -> {completed | error}`.
    /// Staying in the same non-terminal state is allowed.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank() && next != Self::Idle
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn icon(&self) -> &str {
        match self {
            Self::Idle => "💤",
            Self::Uploading => "📤",
            Self::Processing => "⚡",
            Self::Completed => "✅",
            Self::Error => "❌",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Tracked state of one generation request.
///
/// `result_reference` is present iff the status is `completed`, and
/// `error_detail` only ever accompanies `error`. Both are enforced by
/// [`JobRecord::apply`], the only way a stored record changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// `None` only for a record promoted from a draft that has not been
    /// acknowledged by the service yet.
    pub id: Option<JobId>,
    pub status: JobStatus,
    pub prompt: String,
    pub preprocessor: Preprocessor,
    pub result_reference: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn is_id(&self, id: &JobId) -> bool {
        self.id.as_ref() == Some(id)
    }

    /// Apply a partial update, returning whether anything changed.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<bool, TransitionError> {
        let next = patch.status.unwrap_or(self.status);

        let (result_reference, error_detail) = match next {
            JobStatus::Completed => {
                let result = patch
                    .result_reference
                    .clone()
                    .or_else(|| self.result_reference.clone())
                    .ok_or(TransitionError::MissingResult)?;
                (Some(result), None)
            }
            JobStatus::Error => (
                None,
                patch.error_detail.clone().or_else(|| self.error_detail.clone()),
            ),
            _ => (None, None),
        };

        let changed = next != self.status
            || result_reference != self.result_reference
            || error_detail != self.error_detail;

        if self.status.is_terminal() {
            return if changed {
                Err(TransitionError::Frozen(self.status))
            } else {
                Ok(false)
            };
        }

        if !self.status.can_advance_to(next) {
            return Err(TransitionError::Backwards { from: self.status, to: next });
        }

        self.status = next;
        self.result_reference = result_reference;
        self.error_detail = error_detail;
        Ok(changed)
    }
}

/// Partial update for a [`JobRecord`]. Prompt, preprocessor and creation
/// time are immutable after submission, so they cannot be patched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub result_reference: Option<String>,
    pub error_detail: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn completed(result_reference: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result_reference: Some(result_reference.into()),
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            result_reference: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// Bring another copy of the same job up to `record`'s state.
impl From<&JobRecord> for JobPatch {
    fn from(record: &JobRecord) -> Self {
        Self {
            status: Some(record.status),
            result_reference: record.result_reference.clone(),
            error_detail: record.error_detail.clone(),
        }
    }
}
