//! Code Assist backend (OAuth / Cloud Shell 인증)
//!
//! `AuthKind::OauthPersonal`과 `AuthKind::CloudShell`을 담당합니다.
//! 요청을 `{model, project, request}` 봉투로 감싸고 응답의 `{response}`
//! 봉투를 벗깁니다. 네이티브 토큰 계산이 없어 결정적 추정을 사용하고,
//! 임베딩 표면도 없습니다.

use crate::error::BackendError;
use crate::generator::{estimate_tokens, ChunkStream, ContentGenerator};
use crate::types::{
    EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse, TokenCount,
};
use async_trait::async_trait;
use ember_foundation::{BackendConfig, Result};
use futures::TryStreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use super::google::{WireRequest, WireResponse};

const CODE_ASSIST_BASE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// 요청마다 유효한 access token을 공급
///
/// 자격증명 획득 자체는 이 레이어 밖 소관입니다 (OAuth 플로우, 캐시 등).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> std::result::Result<String, BackendError>;
}

/// 고정 토큰 (외부 인증 기계가 갱신해서 넘겨주는 경우, 테스트)
pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> std::result::Result<String, BackendError> {
        Ok(self.0.clone())
    }
}

/// Cloud Shell 메타데이터 서버에서 토큰 조회
pub struct MetadataTokenSource {
    client: Client,
}

impl MetadataTokenSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for MetadataTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> std::result::Result<String, BackendError> {
        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| BackendError::Authentication(format!("metadata server: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackendError::Authentication(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(token.access_token)
    }
}

/// Code Assist backend
pub struct CodeAssistGenerator {
    client: Client,
    model: String,
    project: Option<String>,
    tokens: Arc<dyn TokenSource>,
}

impl CodeAssistGenerator {
    pub fn new(config: &BackendConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
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
            project: None,
            tokens,
        })
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    fn url(&self, action: &str, sse: bool) -> String {
        let alt = if sse { "?alt=sse" } else { "" };
        format!("{}:{}{}", CODE_ASSIST_BASE_URL, action, alt)
    }

    fn envelope(&self, request: &GenerateRequest) -> WireEnvelope {
        WireEnvelope {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            project: self.project.clone(),
            request: WireRequest::shape(request),
        }
    }

    async fn bearer(&self) -> std::result::Result<String, BackendError> {
        Ok(format!("Bearer {}", self.tokens.access_token().await?))
    }
}

#[async_trait]
impl ContentGenerator for CodeAssistGenerator {
    async fn generate(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> std::result::Result<GenerateResponse, BackendError> {
        let envelope = self.envelope(&request);
        let url = self.url("generateContent", false);

        tracing::debug!(model = %envelope.model, prompt_id, "code assist generate");

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer().await?)
            .header("Content-Type", "application/json")
            .json(&envelope)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_http_status(status.as_u16(), &body));
        }

        let wrapped: WireResponseEnvelope = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(wrapped.response.into())
    }

    fn generate_stream(&self, request: GenerateRequest, prompt_id: &str) -> ChunkStream {
        let envelope = self.envelope(&request);
        let url = self.url("streamGenerateContent", true);
        let client = self.client.clone();
        let tokens = self.tokens.clone();
        let prompt_id = prompt_id.to_string();

        Box::pin(async_stream::try_stream! {
            tracing::debug!(model = %envelope.model, prompt_id = %prompt_id, "code assist stream");

            let token = tokens.access_token().await?;
            let response = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Content-Type", "application/json")
                .json(&envelope)
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
                    match serde_json::from_str::<WireResponseEnvelope>(data) {
                        Ok(wrapped) => yield wrapped.response.into(),
                        Err(e) => {
                            tracing::warn!("failed to parse stream chunk: {} - line: {}", e, data);
                        }
                    }
                }
            }
        })
    }

    /// 네이티브 토큰 계산 없음 - 결정적 추정 (문자 수 ÷ 4, 올림)
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
            "code assist has no embedding surface".to_string(),
        ))
    }
}

// ============================================================================
// Wire 봉투 타입
// ============================================================================

#[derive(Debug, Serialize)]
struct WireEnvelope {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<String>,
    request: WireRequest,
}

#[derive(Debug, Deserialize)]
struct WireResponseEnvelope {
    response: WireResponse,
}
