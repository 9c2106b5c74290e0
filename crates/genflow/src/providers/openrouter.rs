use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{truncate, ClientSettings, TextGenerator, MAX_ERROR_BODY};
use crate::credentials::ApiKey;
use crate::error::ProviderError;

const TEMPERATURE: f64 = 0.2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenRouter chat-completions client.
pub struct OpenRouterClient {
    http: Client,
    api_key: ApiKey,
    endpoint: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(api_key: ApiKey, settings: ClientSettings) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(settings.http_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            max_tokens: settings.max_new_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    async fn generate_text(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: TEMPERATURE,
            max_tokens: self.max_tokens,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: truncate(&text, MAX_ERROR_BODY),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        if content.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(content)
    }
}
