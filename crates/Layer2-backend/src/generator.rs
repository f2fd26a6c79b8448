//! ContentGenerator - backend 전략의 공통 계약
//!
//! 생성 시점에 `AuthKind`가 전략으로 해석됩니다 (closed enum dispatch).
//! 지원하지 않는 설정 조합은 호출 시점이 아니라 생성 시점의 치명적
//! 설정 에러입니다.

use crate::backends::code_assist::{CodeAssistGenerator, MetadataTokenSource, TokenSource};
use crate::backends::gateway::GatewayGenerator;
use crate::backends::google::GoogleGenerator;
use crate::error::BackendError;
use crate::types::{
    EmbedRequest, EmbedResponse, GenerateRequest, GenerateResponse, ResponseChunk, TokenCount,
};
use async_trait::async_trait;
use ember_foundation::{AuthKind, BackendConfig, Result, Session};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// 설치 식별자 헤더 (사용 통계 활성 + 실제 API 키 사용 시에만 첨부)
pub const INSTALL_ID_HEADER: &str = "x-ember-install-id";

/// backend 스트림 타입
pub type ChunkStream = Pin<Box<dyn Stream<Item = std::result::Result<ResponseChunk, BackendError>> + Send>>;

/// 콘텐츠 생성 계약
///
/// 스트림은 lazy, single-pass이며 재시작할 수 없습니다.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// 비스트리밍 생성
    async fn generate(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> std::result::Result<GenerateResponse, BackendError>;

    /// 스트리밍 생성
    fn generate_stream(&self, request: GenerateRequest, prompt_id: &str) -> ChunkStream;

    /// 토큰 수 계산
    ///
    /// 네이티브 계산이 없는 전략은 실패하는 대신 결정적으로 추정합니다.
    async fn count_tokens(
        &self,
        request: &GenerateRequest,
    ) -> std::result::Result<TokenCount, BackendError>;

    /// 임베딩
    async fn embed(
        &self,
        request: EmbedRequest,
    ) -> std::result::Result<EmbedResponse, BackendError>;
}

/// 결정적 토큰 추정: 문자 수 ÷ 4, 올림
pub fn estimate_tokens(request: &GenerateRequest) -> TokenCount {
    let chars = request.char_count();
    TokenCount::estimate(chars.div_ceil(4) as u32)
}

/// 설정으로부터 backend 전략 생성
///
/// `auth_kind` 분기는 exhaustive match라서 새 variant 추가 시 컴파일러가
/// 누락을 잡습니다. OauthPersonal은 외부에서 얻은 토큰 소스가 필요하고,
/// CloudShell은 주어지지 않으면 메타데이터 서버 소스를 사용합니다.
pub fn create_content_generator(
    config: &BackendConfig,
    session: &Session,
    tokens: Option<Arc<dyn TokenSource>>,
) -> Result<Box<dyn ContentGenerator>> {
    config.validate()?;

    let generator: Box<dyn ContentGenerator> = match config.auth_kind {
        AuthKind::ApiKey | AuthKind::VertexAi => {
            Box::new(GoogleGenerator::new(config, session)?)
        }
        AuthKind::OauthPersonal => {
            let tokens = tokens.ok_or_else(|| {
                ember_foundation::Error::Config(
                    "oauth-personal auth requires a token source".to_string(),
                )
            })?;
            Box::new(CodeAssistGenerator::new(config, tokens)?)
        }
        AuthKind::CloudShell => {
            let tokens = tokens.unwrap_or_else(|| Arc::new(MetadataTokenSource::new()));
            Box::new(CodeAssistGenerator::new(config, tokens)?)
        }
        AuthKind::Gateway => Box::new(GatewayGenerator::new(config)?),
    };

    Ok(generator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_foundation::DEFAULT_MODEL;

    #[test]
    fn test_estimate_rounds_up() {
        let request = GenerateRequest::from_prompt("abcde"); // 5 chars
        let count = estimate_tokens(&request);
        assert_eq!(count.total, 2);
        assert!(count.is_estimate);
    }

    #[test]
    fn test_estimate_deterministic() {
        let request = GenerateRequest::from_prompt("same input");
        assert_eq!(estimate_tokens(&request), estimate_tokens(&request));
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        // api-key 인증인데 키가 없음 - 생성 시점 에러
        let config = BackendConfig::new(DEFAULT_MODEL, AuthKind::ApiKey);
        let session = Session::new(DEFAULT_MODEL);
        assert!(create_content_generator(&config, &session, None).is_err());
    }

    #[test]
    fn test_factory_requires_tokens_for_oauth() {
        let config = BackendConfig::new(DEFAULT_MODEL, AuthKind::OauthPersonal);
        let session = Session::new(DEFAULT_MODEL);
        assert!(create_content_generator(&config, &session, None).is_err());
    }

    #[test]
    fn test_factory_builds_each_supported_kind() {
        let session = Session::new(DEFAULT_MODEL);

        let api_key = BackendConfig::new(DEFAULT_MODEL, AuthKind::ApiKey).with_api_key("k");
        assert!(create_content_generator(&api_key, &session, None).is_ok());

        let cloud_shell = BackendConfig::new(DEFAULT_MODEL, AuthKind::CloudShell);
        assert!(create_content_generator(&cloud_shell, &session, None).is_ok());

        let gateway = BackendConfig::new(DEFAULT_MODEL, AuthKind::Gateway);
        assert!(create_content_generator(&gateway, &session, None).is_ok());
    }
}
