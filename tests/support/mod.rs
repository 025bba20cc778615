#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use redink::core::config::{OcrSettings, ProviderEndpoint, ProviderSettings};

pub async fn spawn_router(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    format!("http://{addr}")
}

/// Scripted stand-in for the OCR vendor: counts uploads and polls, and
/// walks a fixed response script for the status endpoint.
#[derive(Clone)]
pub struct OcrStub {
    pub base_url: String,
    uploads: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

pub struct OcrScript {
    /// Number of `processing` responses before the document is `processed`.
    pub pending_polls: usize,
    /// Respond 429 with this `Retry-After` on the first poll.
    pub rate_limit_first: Option<u64>,
    /// Report `failed` with this message instead of ever completing.
    pub fail_with: Option<&'static str>,
    /// Never leave `processing`.
    pub never_complete: bool,
    /// Artificial latency per poll, for cancellation tests.
    pub poll_latency: Duration,
    pub pages: Vec<(i64, &'static str)>,
}

impl Default for OcrScript {
    fn default() -> Self {
        Self {
            pending_polls: 0,
            rate_limit_first: None,
            fail_with: None,
            never_complete: false,
            poll_latency: Duration::ZERO,
            pages: vec![(1, "Hello"), (2, "World")],
        }
    }
}

#[derive(Clone)]
struct OcrStubState {
    script: Arc<OcrScript>,
    uploads: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

impl OcrStub {
    pub async fn start(script: OcrScript) -> Self {
        let uploads = Arc::new(AtomicUsize::new(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let state = OcrStubState {
            script: Arc::new(script),
            uploads: uploads.clone(),
            polls: polls.clone(),
        };
        let app = Router::new()
            .route("/documents", post(upload_document))
            .route("/documents/:id", get(poll_document))
            .with_state(state);
        let base_url = spawn_router(app).await;
        Self { base_url, uploads, polls }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// OCR settings pointed at this stub with millisecond-scale delays.
    pub fn settings(&self) -> OcrSettings {
        OcrSettings {
            api_key: "test-key".to_string(),
            base_url: self.base_url.clone(),
            base_poll_delay: Duration::from_millis(10),
            poll_ceiling: Duration::from_millis(100),
            rate_limited_poll_ceiling: Duration::from_millis(150),
            rate_limit_backoff_ceiling: Duration::from_millis(200),
            max_poll_attempts: 20,
            wall_clock_cap: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
        }
    }
}

async fn upload_document(State(state): State<OcrStubState>) -> Json<Value> {
    state.uploads.fetch_add(1, Ordering::SeqCst);
    Json(json!({"id": "doc-123"}))
}

async fn poll_document(State(state): State<OcrStubState>) -> Response {
    let poll = state.polls.fetch_add(1, Ordering::SeqCst);
    let script = &state.script;

    if !script.poll_latency.is_zero() {
        tokio::time::sleep(script.poll_latency).await;
    }

    if poll == 0 {
        if let Some(retry_after) = script.rate_limit_first {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                Json(json!({"message": "rate limited"})),
            )
                .into_response();
        }
    }

    if let Some(message) = script.fail_with {
        return Json(json!({"status": "failed", "message": message})).into_response();
    }

    let pending_budget =
        script.pending_polls + usize::from(script.rate_limit_first.is_some());
    if script.never_complete || poll < pending_budget {
        return Json(json!({"status": "processing"})).into_response();
    }

    let results: Vec<Value> = script
        .pages
        .iter()
        .map(|(number, transcript)| json!({"page_number": number, "transcript": transcript}))
        .collect();
    Json(json!({"status": "processed", "results": results})).into_response()
}

/// OpenAI-compatible grading stub. Counts calls, records request headers
/// and bodies, and returns a canned grading payload.
#[derive(Clone)]
pub struct GradingStub {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

#[derive(Clone)]
struct GradingStubState {
    calls: Arc<AtomicUsize>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    content: Arc<String>,
    latency: Duration,
}

impl GradingStub {
    pub async fn start(content: &str, latency: Duration) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let headers = Arc::new(Mutex::new(Vec::new()));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let state = GradingStubState {
            calls: calls.clone(),
            headers: headers.clone(),
            bodies: bodies.clone(),
            content: Arc::new(content.to_string()),
            latency,
        };
        let app = Router::new()
            .route("/chat/completions", post(chat_completions))
            .with_state(state);
        let base_url = spawn_router(app).await;
        Self { base_url, calls, headers, bodies }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.headers.lock().unwrap().last().cloned()
    }

    pub fn last_body(&self) -> Option<Value> {
        self.bodies.lock().unwrap().last().cloned()
    }

    pub fn endpoint(&self) -> ProviderEndpoint {
        ProviderEndpoint {
            api_key: "test-key".to_string(),
            base_url: self.base_url.clone(),
            default_model: "test-model".to_string(),
        }
    }
}

async fn chat_completions(
    State(state): State<GradingStubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.calls.fetch_add(1, Ordering::SeqCst);
    state.headers.lock().unwrap().push(headers);
    state.bodies.lock().unwrap().push(body);
    if !state.latency.is_zero() {
        tokio::time::sleep(state.latency).await;
    }
    Json(json!({"choices": [{"message": {"content": state.content.as_str()}}]}))
}

/// A plausible model response for the canned grading stub.
pub fn canned_grading_json() -> String {
    json!({
        "score": 88.0,
        "letter_grade": "B+",
        "summary": "内容完整，语言通顺。",
        "corrections": [
            {"category": "grammar", "original": "He go", "corrected": "He goes", "explanation": "主谓一致"}
        ],
        "strengths": ["结构清晰"],
        "improvements": ["多用连接词"],
        "student_name": "Li Hua",
        "date": "2024-05-01",
        "topic": "My Summer Holiday"
    })
    .to_string()
}

/// Provider settings with only OpenAI wired to the grading stub.
pub fn provider_settings(openai: ProviderEndpoint) -> ProviderSettings {
    ProviderSettings {
        openai,
        deepseek: ProviderEndpoint::default(),
        gemini: ProviderEndpoint::default(),
        openrouter: ProviderEndpoint::default(),
        app_url: "https://example.test/redink".to_string(),
        app_title: "Redink Test".to_string(),
        request_timeout: Duration::from_secs(5),
    }
}
