use crate::error::ProviderError;
use crate::models::{EmbeddingOptions, EmbeddingPurpose, GenerationOptions, GenerationRequest};
use crate::traits::{ChatModel, EmbeddingBackend, FragmentStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use url::Url;

const BACKEND: &str = "gemini";
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: String,
    content: Content<'a>,
    task_type: &'static str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    system_instruction: Content<'a>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Ok(Client::builder().timeout(timeout).build()?)
}

fn endpoint(base_url: &str, model: &str, method: &str, sse: bool) -> Result<Url, ProviderError> {
    let model = model.trim_start_matches("models/");
    let mut url = Url::parse(&format!(
        "{}/models/{}:{}",
        base_url.trim_end_matches('/'),
        model,
        method
    ))?;
    if sse {
        url.query_pairs_mut().append_pair("alt", "sse");
    }
    Ok(url)
}

async fn api_error(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());

    match serde_json::from_str::<ApiErrorEnvelope>(&body) {
        Ok(envelope) => ProviderError::Api {
            backend: BACKEND.to_string(),
            status: envelope.error.code.unwrap_or(status),
            code: envelope.error.status,
            message: envelope.error.message,
        },
        Err(_) => ProviderError::Api {
            backend: BACKEND.to_string(),
            status,
            code: None,
            message: body,
        },
    }
}

pub struct GeminiEmbeddingBackend {
    client: Client,
    api_key: String,
    options: EmbeddingOptions,
}

impl GeminiEmbeddingBackend {
    pub fn new(
        api_key: impl Into<String>,
        options: EmbeddingOptions,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config("missing Gemini API key".to_string()));
        }
        Ok(Self {
            client: build_client(options.timeout)?,
            api_key,
            options,
        })
    }
}

#[async_trait]
impl EmbeddingBackend for GeminiEmbeddingBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbeddingPurpose,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let model = self.options.model.trim_start_matches("models/");
        let body = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: format!("models/{model}"),
                    content: Content {
                        role: None,
                        parts: vec![Part { text }],
                    },
                    task_type: purpose.task_type(),
                })
                .collect(),
        };

        let url = endpoint(
            &self.options.base_url,
            model,
            "batchEmbedContents",
            false,
        )?;
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let parsed: BatchEmbedResponse = response.json().await?;
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

pub struct GeminiChatModel {
    client: Client,
    api_key: String,
    options: GenerationOptions,
}

impl GeminiChatModel {
    pub fn new(
        api_key: impl Into<String>,
        options: GenerationOptions,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::Config("missing Gemini API key".to_string()));
        }
        Ok(Self {
            client: build_client(options.timeout)?,
            api_key,
            options,
        })
    }
}

#[async_trait]
impl ChatModel for GeminiChatModel {
    async fn stream_generate(
        &self,
        request: GenerationRequest,
    ) -> Result<FragmentStream, ProviderError> {
        let body = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![Part {
                    text: &request.user_prompt,
                }],
            }],
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: &request.system_instruction,
                }],
            },
            generation_config: GenerationConfig {
                max_output_tokens: request.max_output_tokens,
                temperature: request.temperature,
            },
        };

        let url = endpoint(
            &self.options.base_url,
            &self.options.model,
            "streamGenerateContent",
            true,
        )?;
        let response = self
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let mut bytes = response.bytes_stream().boxed();
        let fragments = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => buffer.extend_from_slice(&chunk),
                    Err(transport) => {
                        yield Err(ProviderError::from(transport));
                        return;
                    }
                }

                // events may straddle network chunks; only complete lines are decoded
                while let Some(line_end) = buffer.iter().position(|byte| *byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=line_end).collect();
                    match parse_sse_line(&String::from_utf8_lossy(&line)) {
                        Ok(Some(text)) => {
                            yield Ok(text);
                        }
                        Ok(None) => {}
                        Err(failure) => {
                            yield Err(failure);
                            return;
                        }
                    }
                }
            }

            match parse_sse_line(&String::from_utf8_lossy(&buffer)) {
                Ok(Some(text)) => {
                    yield Ok(text);
                }
                Ok(None) => {}
                Err(failure) => {
                    yield Err(failure);
                }
            }
        };

        Ok(fragments.boxed())
    }
}

/// Decodes one server-sent-events line into the text it carries, if any.
fn parse_sse_line(line: &str) -> Result<Option<String>, ProviderError> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|parse_error| {
        warn!(error = %parse_error, "undecodable gemini stream event");
        ProviderError::InvalidResponse {
            backend: BACKEND.to_string(),
            details: format!("stream event could not be decoded: {parse_error}"),
        }
    })?;

    if let Some(api) = chunk.error {
        return Err(ProviderError::Api {
            backend: BACKEND.to_string(),
            status: api.code.unwrap_or(500),
            code: api.status,
            message: api.message,
        });
    }

    let text: String = chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}
