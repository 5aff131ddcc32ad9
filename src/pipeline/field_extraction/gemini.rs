use std::collections::VecDeque;
use std::sync::Mutex;

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::types::{Attachment, GenerationRequest, LlmClient};
use super::ExtractionError;
use crate::pipeline_config::ExtractionConfig;

/// Environment variable holding the Gemini API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Gemini `generateContent` HTTP client.
pub struct GeminiClient {
    api_base: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl GeminiClient {
    /// Create a client. A missing key is reported on the first call, not here.
    pub fn new(
        api_base: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ExtractionError::HttpClient(e.to_string()))?;

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
            timeout_secs,
        })
    }

    /// Client configured from `GEMINI_API_KEY` and the extraction config.
    pub fn from_env(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        Self::new(
            &config.api_base,
            std::env::var(API_KEY_ENV).ok(),
            config.request_timeout_secs,
        )
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.trim_start_matches('/');
        if model.starts_with("models/") {
            format!("{}/{model}:generateContent", self.api_base)
        } else {
            format!("{}/models/{model}:generateContent", self.api_base)
        }
    }
}

/// Request body for `models/{model}:generateContent`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    InlineData { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
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
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn request_body<'a>(request: &'a GenerationRequest<'a>) -> GenerateContentRequest<'a> {
    let mut parts = vec![Part::Text {
        text: request.prompt,
    }];
    parts.extend(request.attachments.iter().map(inline_part));

    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
        generation_config: GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
            response_mime_type: request.json_mode.then_some("application/json"),
        },
    }
}

fn inline_part<'a>(attachment: &Attachment) -> Part<'a> {
    Part::InlineData {
        inline_data: InlineData {
            mime_type: attachment.mime_type(),
            data: base64::engine::general_purpose::STANDARD.encode(&attachment.bytes),
        },
    }
}

fn response_text(response: GenerateContentResponse) -> String {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

impl LlmClient for GeminiClient {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ExtractionError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ExtractionError::MissingCredentials(format!("{API_KEY_ENV} is not set"))
        })?;

        let url = self.endpoint(request.model);
        let body = request_body(request);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_connect() {
                    ExtractionError::Connection(self.api_base.clone())
                } else if e.is_timeout() {
                    ExtractionError::HttpClient(format!(
                        "Request timed out after {}s",
                        self.timeout_secs
                    ))
                } else {
                    ExtractionError::HttpClient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ExtractionError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response.json().map_err(|e| {
            ExtractionError::Malformed {
                message: format!("Unexpected response envelope: {e}"),
                raw_excerpt: String::new(),
            }
        })?;

        Ok(response_text(parsed))
    }
}

/// Mock LLM client for testing: replays scripted responses in order.
///
/// When the script runs out, the fallback response (if any) is returned,
/// otherwise the call fails as if the backend were unreachable.
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, ExtractionError>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
    attachment_counts: Mutex<Vec<usize>>,
}

impl MockLlmClient {
    /// Always answer with `response`.
    pub fn new(response: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response.to_string()),
            prompts: Mutex::new(Vec::new()),
            attachment_counts: Mutex::new(Vec::new()),
        }
    }

    /// Answer with each scripted result once, in order.
    pub fn scripted(script: Vec<Result<String, ExtractionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
            attachment_counts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn attachment_counts(&self) -> Vec<usize> {
        self.attachment_counts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String, ExtractionError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.to_string());
        }
        if let Ok(mut counts) = self.attachment_counts.lock() {
            counts.push(request.attachments.len());
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match (next, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(response)) => Ok(response.clone()),
            (None, None) => Err(ExtractionError::Connection("mock script exhausted".into())),
        }
    }
}
