//! Error types for EmberCode
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// EmberCode 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 인증 관련
    // ========================================================================
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    // ========================================================================
    // Backend 관련
    // ========================================================================
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("API error: {backend} - {message}")]
    Api { backend: String, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // ========================================================================
    // Policy 관련
    // ========================================================================
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    // ========================================================================
    // Turn 관련
    // ========================================================================
    #[error("Turn failed: {0}")]
    Turn(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::AuthRequired(_)
                | Error::PolicyDenied(_)
                | Error::InvalidInput(_)
                | Error::Cancelled
        )
    }

    /// API 에러 생성 헬퍼
    pub fn api(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Api {
            backend: backend.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
