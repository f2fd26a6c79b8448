//! OpenAI 호환 게이트웨이 backend
//!
//! `AuthKind::Gateway`를 담당합니다. 게이트웨이는 chat-completions 형태의
//! 단순한 표면만 제공하므로:
//! - 제네릭 content 목록을 role 접두사가 붙은 단일 프롬프트 문자열로 평탄화
//! - 구조화 출력 요청 시 JSON 지시문을 프롬프트에 주입
//! - 네이티브 함수 호출 없음 - 모델이 인라인으로 내보낸 호출은 상위
//!   레이어의 extractor가 복구
//! - 토큰 계산은 결정적 추정

use crate::error::BackendError;
use crate::generator::{estimate_tokens, ChunkStream, ContentGenerator};
use crate::types::{
    Candidate, Content, EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse, Part,
    TokenCount, UsageMetadata,
};
use async_trait::async_trait;
use ember_foundation::{BackendConfig, Result};
use futures::TryStreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080/v1/chat/completions";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

const STRUCTURED_OUTPUT_INSTRUCTION: &str =
    "Respond ONLY with a JSON object matching this schema, with no surrounding text:";

/// 게이트웨이 backend
pub struct GatewayGenerator {
    client: Client,
    model: String,
    base_url: String,
}

impl GatewayGenerator {
    pub fn new(config: &BackendConfig) -> Result<Self> {
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

        Ok(Self {
            client,
            model: config.model.clone(),
            base_url: DEFAULT_GATEWAY_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 제네릭 content 목록을 단일 프롬프트 문자열로 평탄화
    fn flatten_prompt(request: &GenerateRequest) -> String {
        let mut prompt = String::new();

        if let Some(system) = &request.system_instruction {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }

        for content in &request.contents {
            for part in &content.parts {
                match part {
                    Part::Text { text, .. } => {
                        prompt.push_str(&content.role);
                        prompt.push_str(": ");
                        prompt.push_str(text);
                        prompt.push('\n');
                    }
                    Part::FunctionCall { function_call } => {
                        prompt.push_str(&format!(
                            "{}: [called {}({})]\n",
                            content.role, function_call.name, function_call.args
                        ));
                    }
                    Part::FunctionResponse { function_response } => {
                        prompt.push_str(&format!(
                            "{}: [result of {}: {}]\n",
                            content.role, function_response.name, function_response.response
                        ));
                    }
                }
            }
        }

        if request.wants_structured_output() {
            if let Some(schema) = request
                .generation_config
                .as_ref()
                .and_then(|c| c.response_schema.as_ref())
            {
                prompt.push('\n');
                prompt.push_str(STRUCTURED_OUTPUT_INSTRUCTION);
                prompt.push('\n');
                prompt.push_str(&schema.to_string());
                prompt.push('\n');
            }
        }

        prompt
    }

    fn shape(&self, request: &GenerateRequest, stream: bool) -> WireChatRequest {
        WireChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            messages: vec![WireChatMessage {
                role: "user".to_string(),
                content: Self::flatten_prompt(request),
            }],
            max_tokens: request
                .generation_config
                .as_ref()
                .and_then(|c| c.max_output_tokens),
            temperature: request
                .generation_config
                .as_ref()
                .and_then(|c| c.temperature),
            stream,
        }
    }
}

#[async_trait]
impl ContentGenerator for GatewayGenerator {
    async fn generate(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> std::result::Result<GenerateResponse, BackendError> {
        let wire = self.shape(&request, false);

        tracing::debug!(model = %wire.model, prompt_id, "gateway generate");

        let response = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .json(&wire)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_http_status(status.as_u16(), &body));
        }

        let api_response: WireChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .unwrap_or_default();

        let mut reshaped = GenerateResponse::from_text(text);
        reshaped.usage = api_response.usage.map(|u| UsageMetadata {
            prompt_tokens: u.prompt_tokens,
            candidate_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        Ok(reshaped)
    }

    fn generate_stream(&self, request: GenerateRequest, prompt_id: &str) -> ChunkStream {
        let wire = self.shape(&request, true);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let prompt_id = prompt_id.to_string();

        Box::pin(async_stream::try_stream! {
            tracing::debug!(model = %wire.model, prompt_id = %prompt_id, "gateway stream");

            let response = client
                .post(&base_url)
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream")
                .json(&wire)
                .send()
                .await
                .map_err(|e| BackendError::Network(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                Err(BackendError::from_http_status(status.as_u16(), &body))?;
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
                    if data == "[DONE]" {
                        break;
                    }

                    match serde_json::from_str::<WireChatChunk>(data) {
                        Ok(chunk) => {
                            let text = chunk
                                .choices
                                .into_iter()
                                .next()
                                .and_then(|c| c.delta)
                                .and_then(|d| d.content)
                                .unwrap_or_default();

                            let mut reshaped = if text.is_empty() {
                                GenerateResponse::default()
                            } else {
                                GenerateResponse {
                                    candidates: vec![Candidate {
                                        content: Some(Content {
                                            role: "model".to_string(),
                                            parts: vec![Part::text(text)],
                                        }),
                                        finish_reason: None,
                                    }],
                                    usage: None,
                                }
                            };
                            reshaped.usage = chunk.usage.map(|u| UsageMetadata {
                                prompt_tokens: u.prompt_tokens,
                                candidate_tokens: u.completion_tokens,
                                total_tokens: u.total_tokens,
                            });

                            if !reshaped.candidates.is_empty() || reshaped.usage.is_some() {
                                yield reshaped;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("failed to parse stream chunk: {} - line: {}", e, data);
                        }
                    }
                }
            }
        })
    }

    /// 게이트웨이는 토큰 계산 표면이 없음 - 결정적 추정
    async fn count_tokens(
        &self,
        request: &GenerateRequest,
    ) -> std::result::Result<TokenCount, BackendError> {
        Ok(estimate_tokens(request))
    }

    async fn embed(
        &self,
        _request: EmbedRequest,
    ) -> std::result::Result<EmbedResponse, BackendError> {
        Err(BackendError::NotSupported(
            "gateway has no embedding surface".to_string(),
        ))
    }
}

// ============================================================================
// Wire 타입 (chat-completions 형태)
// ============================================================================

#[derive(Debug, Serialize)]
struct WireChatRequest {
    model: String,
    messages: Vec<WireChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    choices: Vec<WireChatChoice>,
    #[serde(default)]
    usage: Option<WireChatUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChatChoice {
    #[serde(default)]
    message: Option<WireChatContent>,
}

#[derive(Debug, Deserialize)]
struct WireChatContent {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireChatChunk {
    #[serde(default)]
    choices: Vec<WireChatDeltaChoice>,
    #[serde(default)]
    usage: Option<WireChatUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChatDeltaChoice {
    #[serde(default)]
    delta: Option<WireChatDelta>,
}

#[derive(Debug, Deserialize)]
struct WireChatDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}
