//! Drives the whole client against an in-process fake of the generation
//! service.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;
use cn_app::draft::{DraftPatch, DraftRequest, ImageAttachment};
use cn_app::error::{SubmitError, TransportError, ValidationError};
use cn_app::generator::Generator;
use cn_app::generator::backend::config::BackendConfig;
use cn_app::generator::backend::{GenBackend, GenerationService};
use cn_app::generator::poller::{PollExit, TRANSPORT_FAILURE_DETAIL};
use cn_app::job::{JobId, JobStatus};
use cn_app::view::{self, ResultView};
use cn_app::Preprocessor;

#[derive(Debug, Default, Clone)]
struct Upload {
    file_name: Option<String>,
    content_type: Option<String>,
    image_len: usize,
    prompt: String,
    preprocessor: String,
}

#[derive(Default)]
struct FakeService {
    /// Ids handed out by `POST /generate`, in order; random once exhausted.
    ids: Mutex<VecDeque<String>>,
    /// Responses for `GET /generations/{id}`; the last one repeats.
    scripts: Mutex<HashMap<String, VecDeque<Value>>>,
    listing: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<Upload>>,
}

impl FakeService {
    fn script(&self, id: &str, responses: Vec<Value>) {
        self.scripts.lock().unwrap().insert(id.to_string(), responses.into());
    }
}

fn record(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "status": status,
        "prompt": "a cat in armor",
        "preprocessor": "pose",
        "created_at": "2024-05-01T12:30:00.000000",
    })
}

async fn generate(
    State(fake): State<Arc<FakeService>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, StatusCode> {
    let mut upload = Upload::default();

    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                upload.file_name = field.file_name().map(str::to_string);
                upload.content_type = field.content_type().map(str::to_string);
                upload.image_len = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?.len();
            }
            "prompt" => upload.prompt = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?,
            "preprocessor" => upload.preprocessor = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?,
            _ => {}
        }
    }

    if upload.image_len == 0 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    fake.uploads.lock().unwrap().push(upload);

    let id = fake
        .ids
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    fake.scripts
        .lock()
        .unwrap()
        .entry(id.clone())
        .or_insert_with(|| VecDeque::from([record(&id, "pending")]));

    Ok(Json(json!({
        "id": id,
        "status": "pending",
        "message": "Generation task queued successfully",
    })))
}

async fn lookup(
    State(fake): State<Arc<FakeService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut scripts = fake.scripts.lock().unwrap();
    let script = scripts.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    let body = if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    };
    body.map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list(State(fake): State<Arc<FakeService>>, Query(params): Query<ListParams>) -> Json<Value> {
    let listing = fake.listing.lock().unwrap();
    let limit = params.limit.unwrap_or(listing.len());
    Json(Value::Array(listing.iter().take(limit).cloned().collect()))
}

async fn serve(fake: Arc<FakeService>) -> BackendConfig {
    let app = Router::new()
        .route("/api/generate", post(generate))
        .route("/api/generations", get(list))
        .route("/api/generations/{id}", get(lookup))
        .with_state(fake);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    BackendConfig {
        base_url: Url::parse(&format!("http://{addr}")).unwrap(),
        poll_interval: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        ..BackendConfig::default()
    }
}

fn fill_draft(generator: &Generator, prompt: &str) {
    generator.update_draft(DraftPatch::image(ImageAttachment::from_bytes("cat.png", vec![0x89, b'P', b'N', b'G'])));
    generator.update_draft(DraftPatch::prompt(prompt));
    generator.update_draft(DraftPatch::preprocessor(Preprocessor::Pose));
}

#[tokio::test]
async fn test_end_to_end_generation() {
    let fake = Arc::new(FakeService::default());
    fake.ids.lock().unwrap().push_back("42".into());
    let mut done = record("42", "completed");
    done["resultUrl"] = json!("/out/42.png");
    fake.script("42", vec![record("42", "pending"), record("42", "processing"), done]);

    let config = serve(fake.clone()).await;
    let generator = Generator::new(config).unwrap();
    fill_draft(&generator, "a cat in armor");

    let handle = generator.submit_draft().await.unwrap();
    assert_eq!(handle.id(), &JobId::new("42"));

    let recent = generator.store().most_recent().unwrap();
    assert_eq!(recent.status, JobStatus::Uploading);
    assert!(!view::submit_enabled(&generator.store().draft()));

    assert_eq!(handle.finished().await, PollExit::Terminal(JobStatus::Completed));

    let history = generator.store().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, Some(JobId::new("42")));
    assert_eq!(history[0].status, JobStatus::Completed);
    assert_eq!(history[0].result_reference.as_deref(), Some("/out/42.png"));

    let snapshot = generator.store().snapshot();
    let ResultView::Completed { url: Some(url), .. } = view::result_view(&snapshot, generator.config()) else {
        panic!("expected a completed result view");
    };
    assert_eq!(url.path(), "/out/42.png");
    assert_eq!(url.host_str(), Some("127.0.0.1"));

    let uploads = fake.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].prompt, "a cat in armor");
    assert_eq!(uploads[0].preprocessor, "pose");
    assert_eq!(uploads[0].file_name.as_deref(), Some("cat.png"));
    assert_eq!(uploads[0].content_type.as_deref(), Some("image/png"));
    assert_eq!(uploads[0].image_len, 4);
}

#[tokio::test]
async fn test_service_assigned_id_is_tracked() {
    let fake = Arc::new(FakeService::default());
    let config = serve(fake.clone()).await;
    let generator = Generator::new(config).unwrap();
    fill_draft(&generator, "a lighthouse at dusk");

    let handle = generator.submit_draft().await.unwrap();
    assert!(Uuid::parse_str(handle.id().as_str()).is_ok());
    assert_eq!(generator.store().active_id().as_ref(), Some(handle.id()));

    handle.cancel();
    assert_eq!(handle.finished().await, PollExit::Cancelled);
    assert_eq!(generator.store().most_recent().unwrap().status, JobStatus::Uploading);
}

#[tokio::test]
async fn test_lost_job_fails_with_transport_detail() {
    let fake = Arc::new(FakeService::default());
    fake.ids.lock().unwrap().push_back("7".into());

    let config = serve(fake.clone()).await;
    let generator = Generator::new(config).unwrap();
    fill_draft(&generator, "a cat in armor");

    let handle = generator.submit_draft().await.unwrap();
    fake.scripts.lock().unwrap().remove("7");

    assert_eq!(handle.finished().await, PollExit::TransportFailed);

    let job = generator.store().job(&JobId::new("7")).unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error_detail.as_deref(), Some(TRANSPORT_FAILURE_DETAIL));
}

#[tokio::test]
async fn test_validation_never_reaches_the_service() {
    let fake = Arc::new(FakeService::default());
    let config = serve(fake.clone()).await;
    let generator = Generator::new(config).unwrap();

    let draft = DraftRequest {
        prompt: "   ".into(),
        image: Some(ImageAttachment::from_bytes("cat.png", vec![1, 2, 3])),
        ..Default::default()
    };
    let err = generator.submit(&draft).await.unwrap_err();
    assert!(matches!(err, SubmitError::Validation(ValidationError::EmptyPrompt)));

    assert!(fake.uploads.lock().unwrap().is_empty());
    assert!(generator.store().history().is_empty());
}

#[tokio::test]
async fn test_backend_maps_http_errors() {
    let fake = Arc::new(FakeService::default());
    let config = serve(fake).await;
    let backend = GenBackend::new(config).unwrap();

    let err = backend.fetch(&JobId::new("missing")).await.unwrap_err();
    assert!(matches!(err, TransportError::Api { status: 404, .. }));
}

#[tokio::test]
async fn test_refresh_history_respects_limit() {
    let fake = Arc::new(FakeService::default());
    {
        let mut listing = fake.listing.lock().unwrap();
        let mut first = record("1", "completed");
        first["output_image_path"] = json!("generations/1.png");
        listing.push(first);
        let mut second = record("2", "failed");
        second["error_message"] = json!("model failure");
        listing.push(second);
        listing.push(record("3", "processing"));
    }

    let config = BackendConfig {
        history_limit: 2,
        ..serve(fake).await
    };
    let generator = Generator::new(config).unwrap();

    assert_eq!(generator.refresh_history().await.unwrap(), 2);

    let failed = generator.store().job(&JobId::new("2")).unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.error_detail.as_deref(), Some("model failure"));
    assert!(generator.store().job(&JobId::new("3")).is_none());
    assert_eq!(generator.store().active_id(), None);
}
