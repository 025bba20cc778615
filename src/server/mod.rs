use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::core::config::Settings;

/// Local transcript save server. One endpoint, consumed best-effort by the
/// OCR side channel; a failure here never blocks essay processing.
#[derive(Clone)]
struct ServerState {
    root: Arc<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveOcrRequest {
    filename: String,
    content: String,
    #[serde(default)]
    image_filename: Option<String>,
    #[serde(default)]
    image_relative_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveOcrResponse {
    saved: bool,
    path: String,
    image_copied: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { status: status.as_u16(), detail: detail.into() }))
}

pub fn router(root: PathBuf) -> Router {
    Router::new()
        .route("/api/save-ocr", post(save_ocr))
        .layer(CorsLayer::permissive())
        .with_state(ServerState { root: Arc::new(root) })
}

async fn save_ocr(
    State(state): State<ServerState>,
    Json(request): Json<SaveOcrRequest>,
) -> Result<Json<SaveOcrResponse>, (StatusCode, Json<ErrorResponse>)> {
    if request.content.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "content must not be empty"));
    }

    let filename = markdown_filename(&request.filename);
    let target = state.root.join(&filename);

    tokio::fs::create_dir_all(state.root.as_ref()).await.map_err(|err| {
        tracing::error!(error = %err, "Failed to create archive directory");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "cannot create archive directory")
    })?;
    tokio::fs::write(&target, &request.content).await.map_err(|err| {
        tracing::error!(error = %err, path = %target.display(), "Failed to write transcript");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "cannot write transcript")
    })?;

    let image_copied = copy_source_image(&state, &request).await;

    tracing::info!(path = %target.display(), image_copied, "Transcript saved");
    Ok(Json(SaveOcrResponse { saved: true, path: target.display().to_string(), image_copied }))
}

/// Best-effort copy of the original image next to the transcript; absence or
/// failure only clears the flag in the response.
async fn copy_source_image(state: &ServerState, request: &SaveOcrRequest) -> bool {
    let Some(relative) = request.image_relative_path.as_deref() else {
        return false;
    };
    let source = PathBuf::from(relative);
    if !source.is_file() {
        return false;
    }

    let name = request
        .image_filename
        .as_deref()
        .map(file_name_component)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| file_name_component(relative));
    if name.is_empty() {
        return false;
    }

    let image_dir = state.root.join("images");
    if let Err(err) = tokio::fs::create_dir_all(&image_dir).await {
        tracing::warn!(error = %err, "Failed to create image directory");
        return false;
    }
    match tokio::fs::copy(&source, image_dir.join(&name)).await {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(error = %err, source = %source.display(), "Failed to copy source image");
            false
        }
    }
}

/// Strip any path components and force a `.md` extension. Empty or hostile
/// names fall back to a generic transcript name.
fn markdown_filename(raw: &str) -> String {
    let name = file_name_component(raw);
    let name = name.trim_matches('.').trim();
    if name.is_empty() {
        return "transcript.md".to_string();
    }
    if name.to_ascii_lowercase().ends_with(".md") {
        name.to_string()
    } else {
        format!("{name}.md")
    }
}

fn file_name_component(raw: &str) -> String {
    Path::new(raw.replace('\\', "/").as_str())
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let root = settings.archive().directory.clone();
    let app = router(root.clone());
    let listener = tokio::net::TcpListener::bind(settings.server_addr()).await?;

    tracing::info!(
        addr = %settings.server_addr(),
        root = %root.display(),
        "Transcript save server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::core::shutdown::shutdown_signal())
        .await?;

    Ok(())
}
