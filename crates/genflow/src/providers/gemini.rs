use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{truncate, ClientSettings, TextGenerator, MAX_ERROR_BODY};
use crate::credentials::ApiKey;
use crate::error::ProviderError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Google Gemini `generateContent` client.
pub struct GeminiClient {
    http: Client,
    api_key: ApiKey,
    base_url: String,
    max_output_tokens: u32,
}

impl GeminiClient {
    pub fn new(api_key: ApiKey, settings: ClientSettings) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(settings.http_timeout).build()?;
        Ok(Self {
            http,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_output_tokens: settings.max_new_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate_text(&self, prompt: &str, model: &str) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        };

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.api_key.expose())
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

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        // Blocked prompts come back with no candidates.
        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return Err(ProviderError::EmptyResponse);
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}
