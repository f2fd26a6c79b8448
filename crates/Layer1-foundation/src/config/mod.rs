//! Backend 설정 타입
//!
//! 콘텐츠 생성 호출 하나에 대해 불변인 설정입니다. 파일 로딩/병합은
//! 상위 레이어 소관이며, 여기서는 타입과 검증만 담당합니다.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// 기본 모델
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// 할당량 초과 시 전환되는 폴백 모델
pub const DEFAULT_FALLBACK_MODEL: &str = "gemini-2.5-flash";

/// 인증 방식
///
/// 각 variant가 정확히 하나의 backend 전략에 대응합니다. 새 backend를
/// 추가하면 컴파일러가 누락된 분기를 잡아냅니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    /// API 키 직접 사용
    ApiKey,
    /// Vertex AI (API 키 또는 ADC)
    VertexAi,
    /// 개인 OAuth 로그인 (폴백 모델 지원이 있는 유일한 경로)
    OauthPersonal,
    /// Cloud Shell 환경 자격증명
    CloudShell,
    /// OpenAI 호환 게이트웨이
    Gateway,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api-key",
            Self::VertexAi => "vertex-ai",
            Self::OauthPersonal => "oauth-personal",
            Self::CloudShell => "cloud-shell",
            Self::Gateway => "gateway",
        }
    }

    /// API 키를 사용하는 인증 방식인지
    pub fn uses_api_key(&self) -> bool {
        matches!(self, Self::ApiKey | Self::VertexAi)
    }
}

impl std::fmt::Display for AuthKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend 설정
///
/// 콘텐츠 생성 호출당 불변. `auth_kind`가 어떤 어댑터 분기가 실행될지
/// 결정합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// 모델 ID (예: "gemini-2.5-pro")
    pub model: String,

    /// 인증 방식
    pub auth_kind: AuthKind,

    /// API 키 (auth_kind가 ApiKey/VertexAi일 때만)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Vertex AI 엔드포인트 사용 여부
    #[serde(default)]
    pub use_vertex: bool,

    /// HTTP 프록시 URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl BackendConfig {
    pub fn new(model: impl Into<String>, auth_kind: AuthKind) -> Self {
        Self {
            model: model.into(),
            auth_kind,
            api_key: None,
            use_vertex: auth_kind == AuthKind::VertexAi,
            proxy: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// 설정 검증
    ///
    /// 불변 조건: `api_key`는 `auth_kind ∈ {ApiKey, VertexAi}`일 때만 설정.
    /// 위반은 생성 시점의 치명적 설정 에러입니다.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }

        match self.auth_kind {
            AuthKind::ApiKey => {
                if self.api_key.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Config(
                        "api-key auth requires an API key".to_string(),
                    ));
                }
            }
            AuthKind::VertexAi => {
                // Vertex는 ADC로도 동작하므로 키는 선택
            }
            AuthKind::OauthPersonal | AuthKind::CloudShell | AuthKind::Gateway => {
                if self.api_key.is_some() {
                    return Err(Error::Config(format!(
                        "api_key must not be set for {} auth",
                        self.auth_kind
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_required() {
        let config = BackendConfig::new(DEFAULT_MODEL, AuthKind::ApiKey);
        assert!(config.validate().is_err());

        let config = config.with_api_key("test-key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_api_key_forbidden_for_oauth() {
        let config =
            BackendConfig::new(DEFAULT_MODEL, AuthKind::OauthPersonal).with_api_key("leaked");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vertex_key_optional() {
        let config = BackendConfig::new(DEFAULT_MODEL, AuthKind::VertexAi);
        assert!(config.validate().is_ok());
        assert!(config.use_vertex);
    }

    #[test]
    fn test_empty_model_rejected() {
        let config = BackendConfig::new("", AuthKind::CloudShell);
        assert!(config.validate().is_err());
    }
}
