use std::fmt;
use std::path::Path;
use std::sync::Arc;
use chrono::Utc;
use cn_core::Preprocessor;
use crate::error::ValidationError;
use crate::job::{JobRecord, JobStatus};

const FALLBACK_MIME: &str = "application/octet-stream";

/// Input image waiting to be uploaded with the next submission.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Arc<[u8]>,
}

impl ImageAttachment {
    /// Wrap raw bytes, guessing the MIME type from the file extension.
    pub fn from_bytes(file_name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let file_name = file_name.into();
        let mime_type = image::ImageFormat::from_path(&file_name)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| FALLBACK_MIME.to_string());

        Self {
            file_name,
            mime_type,
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        Ok(Self::from_bytes(file_name, bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ImageAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageAttachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// User-editable form state before submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftRequest {
    pub prompt: String,
    pub preprocessor: Preprocessor,
    pub image: Option<ImageAttachment>,
    /// Submission feedback: `idle`, `uploading` while the service has not
    /// acknowledged yet, `error` after a failed submission.
    pub status: JobStatus,
    pub last_error: Option<String>,
}

impl Default for DraftRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            preprocessor: Preprocessor::Canny,
            image: None,
            status: JobStatus::Idle,
            last_error: None,
        }
    }
}

impl DraftRequest {
    /// Merge a partial update. No validation happens here.
    pub fn merge(&mut self, patch: DraftPatch) -> bool {
        let before = self.clone();

        if let Some(prompt) = patch.prompt {
            self.prompt = prompt;
        }
        if let Some(preprocessor) = patch.preprocessor {
            self.preprocessor = preprocessor;
        }
        if let Some(image) = patch.image {
            self.image = image;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_error) = patch.last_error {
            self.last_error = last_error;
        }

        *self != before
    }

    /// Image first, then the trimmed prompt.
    pub fn validate(&self) -> Result<&ImageAttachment, ValidationError> {
        let image = self
            .image
            .as_ref()
            .filter(|image| !image.is_empty())
            .ok_or(ValidationError::MissingImage)?;

        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        Ok(image)
    }

    /// Build the pre-acknowledgement job record for this draft.
    pub fn promote(&self) -> Result<JobRecord, ValidationError> {
        self.validate()?;

        Ok(JobRecord {
            id: None,
            status: JobStatus::Uploading,
            prompt: self.prompt.clone(),
            preprocessor: self.preprocessor,
            result_reference: None,
            error_detail: None,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftPatch {
    pub prompt: Option<String>,
    pub preprocessor: Option<Preprocessor>,
    pub image: Option<Option<ImageAttachment>>,
    pub status: Option<JobStatus>,
    pub last_error: Option<Option<String>>,
}

impl DraftPatch {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self { prompt: Some(prompt.into()), ..Default::default() }
    }

    pub fn preprocessor(preprocessor: Preprocessor) -> Self {
        Self { preprocessor: Some(preprocessor), ..Default::default() }
    }

    pub fn image(image: ImageAttachment) -> Self {
        Self { image: Some(Some(image)), ..Default::default() }
    }

    pub fn clear_image() -> Self {
        Self { image: Some(None), ..Default::default() }
    }

    pub fn uploading() -> Self {
        Self {
            status: Some(JobStatus::Uploading),
            last_error: Some(None),
            ..Default::default()
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            last_error: Some(Some(detail.into())),
            ..Default::default()
        }
    }
}
