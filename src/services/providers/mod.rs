mod gemini;
mod openai_compat;

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::config::{ProviderEndpoint, ProviderSettings};
use crate::models::grading::{GradingConfig, ProviderKind};
use crate::services::error::ProcessingError;
use crate::services::prompt::PromptBundle;

/// Routes a prompt bundle to the selected provider and returns the raw text
/// the model produced, which callers expect to be a JSON object.
#[derive(Debug)]
pub struct ModelRouter {
    client: Client,
    settings: ProviderSettings,
}

impl ModelRouter {
    pub fn new(settings: ProviderSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(settings.request_timeout)
            .build()
            .context("Failed to build provider HTTP client")?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, provider: ProviderKind) -> &ProviderEndpoint {
        match provider {
            ProviderKind::OpenAi => &self.settings.openai,
            ProviderKind::DeepSeek => &self.settings.deepseek,
            ProviderKind::Gemini => &self.settings.gemini,
            ProviderKind::OpenRouter => &self.settings.openrouter,
        }
    }

    pub async fn grade(
        &self,
        bundle: &PromptBundle,
        config: &GradingConfig,
        token: &CancellationToken,
    ) -> Result<String, ProcessingError> {
        let endpoint = self.endpoint(config.provider);
        // Key presence is checked before any request leaves the process.
        if endpoint.api_key.is_empty() {
            return Err(ProcessingError::MissingApiKey { provider: config.provider.as_str() });
        }
        if token.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }

        let model = if config.model.trim().is_empty() {
            endpoint.default_model.as_str()
        } else {
            config.model.as_str()
        };

        tracing::info!(provider = config.provider.as_str(), model, "Dispatching grading request");

        match config.provider {
            ProviderKind::OpenAi | ProviderKind::DeepSeek => {
                openai_compat::chat_completion(&self.client, endpoint, &[], bundle, model, token)
                    .await
            }
            ProviderKind::OpenRouter => {
                let headers = [
                    ("HTTP-Referer", self.settings.app_url.clone()),
                    ("X-Title", self.settings.app_title.clone()),
                ];
                openai_compat::chat_completion(
                    &self.client,
                    endpoint,
                    &headers,
                    bundle,
                    model,
                    token,
                )
                .await
            }
            ProviderKind::Gemini => {
                gemini::generate_content(&self.client, endpoint, bundle, model, token).await
            }
        }
    }
}

/// Pull the vendor's structured error message out of a failure body, falling
/// back to a generic marker.
pub(crate) fn vendor_error_message(body: &Value) -> String {
    if let Some(error) = body.get("error") {
        if let Some(text) = error.as_str() {
            return text.to_string();
        }
        if let Some(text) = error.get("message").and_then(Value::as_str) {
            return text.to_string();
        }
    }
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("detail").and_then(Value::as_str))
        .unwrap_or("provider request failed")
        .to_string()
}
