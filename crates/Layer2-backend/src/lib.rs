//! # ember-backend
//!
//! Backend adapter layer for EmberCode.
//! N개의 vendor backend를 하나의 `ContentGenerator` 계약 뒤로 정규화합니다.
//!
//! ## Features
//! - SSE streaming for real-time responses
//! - Automatic retry with exponential backoff (quota consultation hook 포함)
//! - AuthKind별 전략 dispatch (ApiKey/VertexAi/OauthPersonal/CloudShell/Gateway)
//! - 네이티브 토큰 계산이 없는 전략의 결정적 추정

pub mod backends;
pub mod error;
pub mod generator;
pub mod retry;
pub mod types;

// Core contract
pub use generator::{
    create_content_generator, estimate_tokens, ChunkStream, ContentGenerator, INSTALL_ID_HEADER,
};

// Request/response types
pub use types::{
    Candidate, Content, EmbedRequest, EmbedResponse, FunctionCallPart, FunctionResponsePart,
    GenerateRequest, GenerateResponse, GenerationConfig, Part, ResponseChunk, TokenCount, ToolDef,
    UsageMetadata,
};

// Error and retry
pub use error::BackendError;
pub use retry::{
    with_retry, with_retry_consult, QuotaDirective, RetryClassification, RetryConfig,
    RetryableError,
};

// Backend strategies
pub use backends::{
    CodeAssistGenerator, GatewayGenerator, GoogleGenerator, MetadataTokenSource,
    StaticTokenSource, TokenSource,
};
