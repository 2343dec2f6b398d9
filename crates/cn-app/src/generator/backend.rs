//! HTTP boundary to the remote generation service.
//!
//! [`GenerationService`] is the seam the submission controller and the
//! status poller talk to; [`GenBackend`] implements it over [`reqwest`].

pub mod config;
pub mod schemas;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::{debug, info};
use crate::error::TransportError;
use crate::generator::backend::config::BackendConfig;
use crate::generator::backend::schemas::{GenerationResponse, JobCreateResponse, SubmitRequest};
use crate::job::JobId;

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// `POST /generate`
    async fn submit(&self, request: SubmitRequest) -> Result<JobCreateResponse, TransportError>;

    /// `GET /generations/{id}`
    async fn fetch(&self, id: &JobId) -> Result<GenerationResponse, TransportError>;

    /// `GET /generations?limit=N`
    async fn history(&self, limit: u32) -> Result<Vec<GenerationResponse>, TransportError>;
}

pub struct GenBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl GenBackend {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        info!("Generation service at {}", config.base_url);

        Ok(Self { client, config })
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling, tests).
    pub fn with_client(client: reqwest::Client, config: BackendConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl GenerationService for GenBackend {
    async fn submit(&self, request: SubmitRequest) -> Result<JobCreateResponse, TransportError> {
        let image = Part::bytes(request.image.bytes.to_vec())
            .file_name(request.image.file_name.clone())
            .mime_str(&request.image.mime_type)?;

        let form = Form::new()
            .part("image", image)
            .text("prompt", request.prompt)
            .text("preprocessor", request.preprocessor.id());

        let response = self
            .client
            .post(self.config.endpoint("/generate"))
            .multipart(form)
            .send()
            .await?;

        let created: JobCreateResponse = Self::parse_response(response).await?;
        info!(job_id = %created.id, status = %created.status, "Generation queued");
        Ok(created)
    }

    async fn fetch(&self, id: &JobId) -> Result<GenerationResponse, TransportError> {
        let response = self
            .client
            .get(self.config.endpoint(&format!("/generations/{}", id)))
            .send()
            .await?;

        let generation: GenerationResponse = Self::parse_response(response).await?;
        debug!(job_id = %id, status = %generation.status, "Fetched generation status");
        generation.ensure_id(id)
    }

    async fn history(&self, limit: u32) -> Result<Vec<GenerationResponse>, TransportError> {
        let response = self
            .client
            .get(self.config.endpoint("/generations"))
            .query(&[("limit", limit)])
            .send()
            .await?;

        Self::parse_response(response).await
    }
}
