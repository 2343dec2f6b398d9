use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use cn_core::Preprocessor;
use crate::draft::ImageAttachment;
use crate::error::TransportError;
use crate::job::{JobId, JobPatch, JobRecord, JobStatus};

pub(crate) const MISSING_RESULT_DETAIL: &str = "Generation completed without a result";

/// Multipart body for `POST /generate`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub image: ImageAttachment,
    pub prompt: String,
    pub preprocessor: Preprocessor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobCreateResponse {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// Job record as returned by `GET /generations/{id}` and `GET /generations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResponse {
    pub id: JobId,
    pub status: JobStatus,
    pub prompt: String,
    pub preprocessor: Preprocessor,
    #[serde(default, rename = "resultUrl", skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl GenerationResponse {
    pub fn result_reference(&self) -> Option<&str> {
        self.result_url
            .as_deref()
            .or(self.output_image_path.as_deref())
            .filter(|r| !r.trim().is_empty())
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error.as_deref().or(self.error_message.as_deref())
    }

    /// Translate into a store update. A `completed` response without a
    /// result locator becomes an `error`.
    pub fn to_patch(&self) -> JobPatch {
        match self.status {
            JobStatus::Completed => match self.result_reference() {
                Some(result) => JobPatch::completed(result),
                None => JobPatch::failed(MISSING_RESULT_DETAIL),
            },
            JobStatus::Error => JobPatch {
                status: Some(JobStatus::Error),
                result_reference: None,
                error_detail: self.error_detail().map(str::to_string),
            },
            status => JobPatch::status(status),
        }
    }

    pub fn into_record(self) -> JobRecord {
        let patch = self.to_patch();
        JobRecord {
            id: Some(self.id),
            status: patch.status.unwrap_or(self.status),
            prompt: self.prompt,
            preprocessor: self.preprocessor,
            result_reference: patch.result_reference,
            error_detail: patch.error_detail,
            created_at: self.created_at,
        }
    }

    pub fn ensure_id(self, expected: &JobId) -> Result<Self, TransportError> {
        if &self.id != expected {
            return Err(TransportError::UnexpectedPayload(format!(
                "asked for job {} but received {}",
                expected, self.id
            )));
        }
        Ok(self)
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn de_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}
