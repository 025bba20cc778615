use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::config::ProviderEndpoint;
use crate::services::error::ProcessingError;
use crate::services::prompt::PromptBundle;
use crate::services::providers::vendor_error_message;

use super::openai_compat::GRADING_TEMPERATURE;

/// One generate-content round trip: system instruction plus a single user
/// turn whose parts are the prompt text and, for image essays, the inline
/// image bytes.
pub(crate) async fn generate_content(
    client: &Client,
    endpoint: &ProviderEndpoint,
    bundle: &PromptBundle,
    model: &str,
    token: &CancellationToken,
) -> Result<String, ProcessingError> {
    let mut parts = vec![json!({"text": bundle.user_prompt})];
    if let Some(image) = &bundle.image {
        parts.push(json!({"inline_data": {"mime_type": image.mime, "data": image.data}}));
    }

    let payload = json!({
        "system_instruction": {"parts": [{"text": bundle.system_prompt}]},
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": {
            "temperature": GRADING_TEMPERATURE,
            "responseMimeType": "application/json",
        },
    });

    let url = format!(
        "{}/models/{}:generateContent?key={}",
        endpoint.base_url, model, endpoint.api_key
    );

    let response = tokio::select! {
        _ = token.cancelled() => return Err(ProcessingError::Cancelled),
        result = client.post(&url).json(&payload).send() => result?,
    };

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(ProcessingError::Vendor(format!(
            "provider request failed (status {}): {}",
            status,
            vendor_error_message(&body)
        )));
    }

    candidate_text(&body).ok_or_else(|| {
        ProcessingError::MalformedResponse("generate-content response carries no text".to_string())
    })
}

fn candidate_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
