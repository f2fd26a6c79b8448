//! Google generative-language / Vertex AI backend (API 키 인증)
//!
//! `AuthKind::ApiKey`와 `AuthKind::VertexAi` 두 경우를 담당합니다.
//! 네이티브 countTokens / batchEmbedContents 엔드포인트를 사용합니다.

use crate::error::BackendError;
use crate::generator::{ChunkStream, ContentGenerator, INSTALL_ID_HEADER};
use crate::types::{
    Candidate, Content, EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse,
    GenerationConfig, TokenCount, ToolDef, UsageMetadata,
};
use async_trait::async_trait;
use ember_foundation::{BackendConfig, Result, Session};
use futures::TryStreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

const API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const VERTEX_BASE_URL: &str = "https://aiplatform.googleapis.com/v1beta1";
const EMBEDDING_MODEL: &str = "text-embedding-004";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Google backend (직접 API 키)
pub struct GoogleGenerator {
    client: Client,
    api_key: String,
    model: String,
    use_vertex: bool,
    /// 사용 통계 동의 + 실제 API 키일 때만 Some
    install_id: Option<String>,
}

impl GoogleGenerator {
    pub fn new(config: &BackendConfig, session: &Session) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| ember_foundation::Error::Config(format!("bad proxy: {}", e)))?,
            );
        }
        let client = builder
            .build()
            .map_err(|e| ember_foundation::Error::Config(format!("http client: {}", e)))?;

        let api_key = config.api_key.clone().unwrap_or_default();
        let install_id = if session.usage_statistics_enabled() && !api_key.is_empty() {
            session.installation_id().map(|s| s.to_string())
        } else {
            None
        };

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            use_vertex: config.use_vertex,
            install_id,
        })
    }

    fn url(&self, model: &str, action: &str, sse: bool) -> String {
        let base = if self.use_vertex {
            format!("{}/publishers/google/models", VERTEX_BASE_URL)
        } else {
            format!("{}/models", API_BASE_URL)
        };
        let alt = if sse { "&alt=sse" } else { "" };
        format!("{}/{}:{}?key={}{}", base, model, action, self.api_key, alt)
    }

    fn effective_model<'a>(&'a self, request: &'a GenerateRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.model)
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(id) = &self.install_id {
            builder = builder.header(INSTALL_ID_HEADER, id);
        }
        builder
    }

    fn parse_error_response(status: reqwest::StatusCode, body: &str) -> BackendError {
        if let Ok(error_response) = serde_json::from_str::<WireErrorResponse>(body) {
            let error = error_response.error;
            return BackendError::from_vendor_status(
                status.as_u16(),
                error.status.as_deref(),
                error.message,
            );
        }

        BackendError::from_http_status(status.as_u16(), body)
    }
}

#[async_trait]
impl ContentGenerator for GoogleGenerator {
    async fn generate(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> std::result::Result<GenerateResponse, BackendError> {
        let model = self.effective_model(&request).to_string();
        let wire = WireRequest::shape(&request);
        let url = self.url(&model, "generateContent", false);

        tracing::debug!(model = %model, prompt_id, "google generate");

        let response = self
            .request_builder(&url)
            .json(&wire)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        let api_response: WireResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(api_response.into())
    }

    fn generate_stream(&self, request: GenerateRequest, prompt_id: &str) -> ChunkStream {
        let model = self.effective_model(&request).to_string();
        let wire = WireRequest::shape(&request);
        let url = self.url(&model, "streamGenerateContent", true);
        let builder = self.request_builder(&url).json(&wire);
        let prompt_id = prompt_id.to_string();

        Box::pin(async_stream::try_stream! {
            tracing::debug!(model = %model, prompt_id = %prompt_id, "google stream");

            let response = builder
                .send()
                .await
                .map_err(|e| BackendError::Network(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(Self::parse_error_response(status, &body))?;
                return;
            }

            let byte_stream = response.bytes_stream();
            let stream_reader = StreamReader::new(
                byte_stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            );
            let mut reader = BufReader::new(stream_reader);
            let mut buffer = String::new();

            loop {
                buffer.clear();
                let n = reader
                    .read_line(&mut buffer)
                    .await
                    .map_err(|e| BackendError::StreamError(format!("stream read: {}", e)))?;
                if n == 0 {
                    break; // EOF
                }

                let line = buffer.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }

                if let Some(data) = line.strip_prefix("data: ") {
                    match serde_json::from_str::<WireResponse>(data) {
                        Ok(chunk) => yield chunk.into(),
                        Err(e) => {
                            tracing::warn!("failed to parse stream chunk: {} - line: {}", e, data);
                        }
                    }
                }
            }
        })
    }

    async fn count_tokens(
        &self,
        request: &GenerateRequest,
    ) -> std::result::Result<TokenCount, BackendError> {
        let model = self.effective_model(request).to_string();
        let url = self.url(&model, "countTokens", false);
        let body = WireCountRequest {
            contents: request.contents.clone(),
        };

        let response = self
            .request_builder(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        let counted: WireCountResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(TokenCount::exact(counted.total_tokens))
    }

    async fn embed(
        &self,
        request: EmbedRequest,
    ) -> std::result::Result<EmbedResponse, BackendError> {
        let url = self.url(EMBEDDING_MODEL, "batchEmbedContents", false);
        let body = WireBatchEmbedRequest {
            requests: request
                .texts
                .iter()
                .map(|text| WireEmbedRequest {
                    model: format!("models/{}", EMBEDDING_MODEL),
                    content: Content::user(text.clone()),
                })
                .collect(),
        };

        let response = self
            .request_builder(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::parse_error_response(status, &body));
        }

        let embedded: WireBatchEmbedResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(EmbedResponse {
            embeddings: embedded.embeddings.into_iter().map(|e| e.values).collect(),
        })
    }
}

// ============================================================================
// Wire 타입 (vendor 고유 형태)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

impl WireRequest {
    /// 제네릭 요청을 vendor wire 형태로 shaping
    pub(crate) fn shape(request: &GenerateRequest) -> Self {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![WireTool {
                function_declarations: request.tools.iter().map(|t| t.into()).collect(),
            }])
        };

        let system_instruction =
            request
                .system_instruction
                .as_ref()
                .map(|s| WireSystemInstruction {
                    parts: vec![WirePart {
                        text: s.to_string(),
                    }],
                });

        Self {
            contents: request.contents.clone(),
            tools,
            system_instruction,
            generation_config: request.generation_config.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireSystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WirePart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolDef> for WireFunctionDeclaration {
    fn from(tool: &ToolDef) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<WireUsageMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

impl From<WireResponse> for GenerateResponse {
    fn from(wire: WireResponse) -> Self {
        GenerateResponse {
            candidates: wire.candidates,
            usage: wire.usage_metadata.map(|u| UsageMetadata {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                candidate_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireCountRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCountResponse {
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireBatchEmbedRequest {
    requests: Vec<WireEmbedRequest>,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct WireBatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

// Error types
#[derive(Debug, Deserialize)]
struct WireErrorResponse {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    status: Option<String>,
}
