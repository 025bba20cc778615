use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::config::ProviderEndpoint;
use crate::services::error::ProcessingError;
use crate::services::prompt::PromptBundle;
use crate::services::providers::vendor_error_message;

/// Deterministic-ish grading; all adapters pin the same low temperature.
pub(crate) const GRADING_TEMPERATURE: f64 = 0.1;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

/// OpenAI-compatible servers return the assistant content either as a plain
/// string or as an array of typed parts; both shapes resolve here instead of
/// being shape-sniffed at call sites.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

impl MessageContent {
    pub(crate) fn into_text(self) -> String {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Parts(parts) => {
                parts.into_iter().filter_map(|part| part.text).collect::<Vec<_>>().join("")
            }
        }
    }
}

/// One chat-completion round trip against an OpenAI-compatible endpoint.
/// `extra_headers` carries the proxy-identifying headers for passthrough
/// providers; the others pass an empty slice.
pub(crate) async fn chat_completion(
    client: &Client,
    endpoint: &ProviderEndpoint,
    extra_headers: &[(&'static str, String)],
    bundle: &PromptBundle,
    model: &str,
    token: &CancellationToken,
) -> Result<String, ProcessingError> {
    let user_content = match &bundle.image {
        Some(image) => json!([
            {"type": "text", "text": bundle.user_prompt},
            {"type": "image_url", "image_url": {"url": image.data_url()}},
        ]),
        None => json!(bundle.user_prompt),
    };

    let payload = json!({
        "model": model,
        "messages": [
            {"role": "system", "content": bundle.system_prompt},
            {"role": "user", "content": user_content},
        ],
        "temperature": GRADING_TEMPERATURE,
        "response_format": {"type": "json_object"},
    });

    let mut request = client
        .post(format!("{}/chat/completions", endpoint.base_url))
        .bearer_auth(&endpoint.api_key)
        .json(&payload);
    for (name, value) in extra_headers {
        request = request.header(*name, value);
    }

    let response = tokio::select! {
        _ = token.cancelled() => return Err(ProcessingError::Cancelled),
        result = request.send() => result?,
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

    let parsed: ChatResponse = serde_json::from_value(body)
        .map_err(|err| ProcessingError::MalformedResponse(err.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(MessageContent::into_text)
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| {
            ProcessingError::MalformedResponse("chat completion carries no content".to_string())
        })
}
