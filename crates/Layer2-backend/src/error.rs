//! Backend 에러 타입
//!
//! BackendError는 vendor API 호출 관련 세부 에러를 관리합니다.
//! ember_foundation::Error와의 변환을 지원합니다.
//!
//! 턴 레이어는 폴백 적격성 판정에 `is_quota()` 하나만 참조합니다.

use crate::retry::{RetryClassification, RetryableError};
use ember_foundation::Error as FoundationError;
use thiserror::Error;

/// Backend 호출 중 발생할 수 있는 에러
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// API 키가 없거나 유효하지 않음
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rate limit 초과
    #[error("Rate limit exceeded{}", .retry_after_ms.map(|ms| format!(", retry after {}ms", ms)).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    /// 할당량 소진 (vendor RESOURCE_EXHAUSTED)
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// 컨텍스트 길이 초과
    #[error("Context length exceeded: {0}")]
    ContextLengthExceeded(String),

    /// 서버 에러 (5xx)
    #[error("Server error: {0}")]
    ServerError(String),

    /// 네트워크 에러 (연결 실패, DNS 등)
    #[error("Network error: {0}")]
    Network(String),

    /// 잘못된 요청 (파라미터 오류)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// API 응답이 기대 형태가 아님
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 모델을 찾을 수 없음
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// 스트리밍 중 에러
    #[error("Stream error: {0}")]
    StreamError(String),

    /// 해당 backend가 지원하지 않는 기능
    #[error("Not supported by this backend: {0}")]
    NotSupported(String),

    /// 취소됨
    #[error("Cancelled")]
    Cancelled,

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RetryableError for BackendError {
    fn classify(&self) -> RetryClassification {
        match self {
            BackendError::RateLimited { retry_after_ms } => RetryClassification::RateLimited {
                retry_after_ms: *retry_after_ms,
            },

            // 5xx와 네트워크/스트림 장애는 일시적일 수 있음
            BackendError::ServerError(_)
            | BackendError::Network(_)
            | BackendError::StreamError(_) => RetryClassification::Retry,

            // 나머지는 재시도해도 결과가 같음
            BackendError::Authentication(_)
            | BackendError::QuotaExceeded(_)
            | BackendError::ContextLengthExceeded(_)
            | BackendError::InvalidRequest(_)
            | BackendError::InvalidResponse(_)
            | BackendError::ModelNotFound(_)
            | BackendError::NotSupported(_)
            | BackendError::Cancelled
            | BackendError::Unknown(_) => RetryClassification::NoRetry,
        }
    }

    /// 폴백 적격성 판정에 쓰이는 할당량/용량 계열인지
    fn is_quota(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. } | BackendError::QuotaExceeded(_)
        )
    }
}

impl BackendError {
    /// 대응되는 HTTP 상태 코드 (있는 경우)
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Authentication(_) => Some(401),
            BackendError::RateLimited { .. } | BackendError::QuotaExceeded(_) => Some(429),
            BackendError::ModelNotFound(_) => Some(404),
            BackendError::InvalidRequest(_) => Some(400),
            BackendError::ServerError(_) => Some(500),
            _ => None,
        }
    }

    /// HTTP 상태 코드와 본문으로부터 생성
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => BackendError::Authentication(body.to_string()),
            429 => BackendError::RateLimited {
                retry_after_ms: extract_retry_after(body),
            },
            400 => {
                if body.contains("context") || body.contains("too long") || body.contains("token") {
                    BackendError::ContextLengthExceeded(body.to_string())
                } else {
                    BackendError::InvalidRequest(body.to_string())
                }
            }
            404 => BackendError::ModelNotFound(body.to_string()),
            500..=599 => BackendError::ServerError(body.to_string()),
            _ => BackendError::Unknown(format!("HTTP {}: {}", status, body)),
        }
    }

    /// vendor 에러 status 문자열 기반 분류 (Google 계열 공통)
    pub fn from_vendor_status(status_code: u16, status: Option<&str>, message: String) -> Self {
        match status {
            Some("RESOURCE_EXHAUSTED") => BackendError::QuotaExceeded(message),
            Some("INVALID_ARGUMENT") => {
                if message.contains("context") || message.contains("token") {
                    BackendError::ContextLengthExceeded(message)
                } else {
                    BackendError::InvalidRequest(message)
                }
            }
            Some("PERMISSION_DENIED") | Some("UNAUTHENTICATED") => {
                BackendError::Authentication(message)
            }
            Some("NOT_FOUND") => BackendError::ModelNotFound(message),
            _ => BackendError::from_http_status(status_code, &message),
        }
    }
}

/// 에러 본문에서 retry-after 값 추출 (밀리초)
fn extract_retry_after(body: &str) -> Option<u64> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(secs) = json
            .get("error")
            .and_then(|e| e.get("retry_after"))
            .and_then(|v| v.as_f64())
        {
            return Some((secs * 1000.0) as u64);
        }
    }

    if let Some(idx) = body.find("retry") {
        let after = &body[idx..];
        let num_str: String = after
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        if let Ok(secs) = num_str.parse::<f64>() {
            return Some((secs * 1000.0) as u64);
        }
    }

    None
}

// ============================================================================
// ember_foundation::Error 변환
// ============================================================================

impl From<BackendError> for FoundationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Authentication(msg) => {
                FoundationError::AuthRequired(format!("Authentication failed: {}", msg))
            }
            BackendError::RateLimited { retry_after_ms } => FoundationError::RateLimited(
                retry_after_ms
                    .map(|ms| format!("Retry after {}ms", ms))
                    .unwrap_or_else(|| "Rate limited".to_string()),
            ),
            BackendError::QuotaExceeded(msg) => FoundationError::RateLimited(msg),
            BackendError::InvalidRequest(msg) => FoundationError::InvalidInput(msg),
            BackendError::Cancelled => FoundationError::Cancelled,
            other => FoundationError::Backend(other.to_string()),
        }
    }
}
