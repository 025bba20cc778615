use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::config::OcrSettings;
use crate::models::essay::ImagePayload;
use crate::services::error::ProcessingError;
use crate::services::transcript::TranscriptArchive;

/// Client for the handwriting OCR vendor: multipart upload to the document
/// endpoint, then status polling with an adaptive delay that honors
/// `Retry-After`, tolerates eventual-consistency 404s and stays within both
/// an attempt budget and a wall-clock budget.
#[derive(Debug)]
pub struct OcrClient {
    client: Client,
    settings: OcrSettings,
    archive: Option<TranscriptArchive>,
}

impl OcrClient {
    pub fn new(settings: OcrSettings, archive: Option<TranscriptArchive>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to build OCR HTTP client")?;
        Ok(Self { client, settings, archive })
    }

    /// Upload the image and poll until the transcript is ready. On success
    /// the transcript is also archived best-effort; archival failures are
    /// logged and never reach the caller.
    pub async fn transcribe(
        &self,
        image: &ImagePayload,
        token: &CancellationToken,
    ) -> Result<String, ProcessingError> {
        if self.settings.api_key.is_empty() {
            return Err(ProcessingError::MissingApiKey { provider: "ocr" });
        }

        let document_id = self.upload(image, token).await?;
        tracing::info!(document_id = %document_id, filename = %image.filename, "OCR document created");

        let transcript = self.poll(&document_id, token).await?;

        if let Some(archive) = &self.archive {
            archive.archive(&transcript, image.source_path.as_deref()).await;
        }

        Ok(transcript)
    }

    async fn upload(
        &self,
        image: &ImagePayload,
        token: &CancellationToken,
    ) -> Result<String, ProcessingError> {
        ensure_not_cancelled(token)?;

        let part = Part::bytes(image.bytes.clone())
            .file_name(image.filename.clone())
            .mime_str(&image.mime)?;
        let form = Form::new()
            .part("file", part)
            .text("action", "transcribe")
            .text("delete_after", "604800");

        let request = self
            .client
            .post(format!("{}/documents", self.settings.base_url))
            .bearer_auth(&self.settings.api_key)
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = token.cancelled() => return Err(ProcessingError::Cancelled),
            result = request => result?,
        };

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(ProcessingError::Vendor(format!(
                "OCR upload failed (status {}): {}",
                status,
                extract_error_message(&body)
            )));
        }

        document_id(&body).ok_or_else(|| {
            ProcessingError::Vendor("OCR upload response missing document id".to_string())
        })
    }

    async fn poll(
        &self,
        document_id: &str,
        token: &CancellationToken,
    ) -> Result<String, ProcessingError> {
        let url = format!("{}/documents/{}", self.settings.base_url, document_id);
        let started = Instant::now();
        let mut backoff = PollBackoff::new(&self.settings);

        for attempt in 0..self.settings.max_poll_attempts {
            ensure_not_cancelled(token)?;
            if started.elapsed() >= self.settings.wall_clock_cap {
                return Err(ProcessingError::OcrTimeout { document_id: document_id.to_string() });
            }

            let request =
                self.client.get(&url).bearer_auth(&self.settings.api_key).send();
            let response = tokio::select! {
                _ = token.cancelled() => return Err(ProcessingError::Cancelled),
                result = request => result?,
            };

            let status = response.status();
            let wait = match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = retry_after_seconds(&response);
                    let wait = backoff.on_rate_limited(retry_after);
                    tracing::warn!(
                        document_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "OCR vendor rate limited"
                    );
                    wait
                }
                // The document endpoint lags the upload; give it extra time.
                StatusCode::NOT_FOUND => backoff.on_not_found(),
                _ => {
                    let body: Value = response.json().await.unwrap_or(Value::Null);
                    if !status.is_success() {
                        return Err(ProcessingError::Vendor(format!(
                            "OCR poll failed (status {}): {}",
                            status,
                            extract_error_message(&body)
                        )));
                    }

                    match body.get("status").and_then(Value::as_str).unwrap_or("") {
                        "processed" => {
                            return join_pages(&body).ok_or_else(|| {
                                ProcessingError::Vendor(format!(
                                    "OCR document {document_id} has no page transcripts"
                                ))
                            });
                        }
                        "failed" => {
                            return Err(ProcessingError::Vendor(format!(
                                "OCR document {} failed: {}",
                                document_id,
                                extract_error_message(&body)
                            )));
                        }
                        _ => backoff.on_pending(),
                    }
                }
            };

            wait_or_cancel(token, wait).await?;
        }

        Err(ProcessingError::OcrTimeout { document_id: document_id.to_string() })
    }
}

/// Adaptive poll delay. The delay is carried forward between iterations and
/// only ever grows, capped at the plain ceiling until the vendor rate-limits
/// us, after which the higher rate-limited ceiling applies.
#[derive(Debug)]
struct PollBackoff {
    base: Duration,
    delay: Duration,
    ceiling: Duration,
    rate_limited_ceiling: Duration,
    rate_limit_backoff_ceiling: Duration,
}

impl PollBackoff {
    fn new(settings: &OcrSettings) -> Self {
        Self {
            base: settings.base_poll_delay,
            delay: settings.base_poll_delay,
            ceiling: settings.poll_ceiling,
            rate_limited_ceiling: settings.rate_limited_poll_ceiling,
            rate_limit_backoff_ceiling: settings.rate_limit_backoff_ceiling,
        }
    }

    fn on_rate_limited(&mut self, retry_after: Option<Duration>) -> Duration {
        self.ceiling = self.rate_limited_ceiling;
        let wait =
            retry_after.unwrap_or_else(|| (self.delay * 2).min(self.rate_limit_backoff_ceiling));
        self.delay = self.delay.max(wait).min(self.ceiling);
        wait
    }

    fn on_not_found(&mut self) -> Duration {
        let wait = self.delay.max(self.base * 2);
        self.delay = wait.min(self.ceiling);
        wait
    }

    fn on_pending(&mut self) -> Duration {
        self.delay.min(self.ceiling)
    }
}

fn ensure_not_cancelled(token: &CancellationToken) -> Result<(), ProcessingError> {
    if token.is_cancelled() {
        return Err(ProcessingError::Cancelled);
    }
    Ok(())
}

async fn wait_or_cancel(
    token: &CancellationToken,
    delay: Duration,
) -> Result<(), ProcessingError> {
    tokio::select! {
        _ = token.cancelled() => Err(ProcessingError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn document_id(body: &Value) -> Option<String> {
    match body.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Join page transcripts in page order with blank-line separators.
fn join_pages(body: &Value) -> Option<String> {
    let results = body.get("results")?.as_array()?;
    let mut pages: Vec<(i64, &str)> = results
        .iter()
        .filter_map(|page| {
            let number = page.get("page_number").and_then(Value::as_i64).unwrap_or(0);
            let transcript = page.get("transcript").and_then(Value::as_str)?;
            Some((number, transcript))
        })
        .collect();
    if pages.is_empty() {
        return None;
    }
    pages.sort_by_key(|(number, _)| *number);
    let joined =
        pages.iter().map(|(_, transcript)| *transcript).collect::<Vec<_>>().join("\n\n");
    Some(joined.trim().to_string())
}

fn extract_error_message(body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error").and_then(Value::as_str))
        .or_else(|| body.get("detail").and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string()
}
