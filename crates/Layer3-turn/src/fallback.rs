//! 쿼터 소진 시 모델 fallback 프로토콜
//!
//! 어떤 backend가 쿼터 오류를 내면 호스트 애플리케이션에 의향을 묻고,
//! 그 답에 따라 turn이 재시도하거나 멈춥니다. 실제 전환 상태는
//! [`ember_foundation::Session`]의 래치가 들고 있습니다.

use ember_foundation::AuthKind;
use futures::future::BoxFuture;
use std::sync::Arc;

/// 호스트가 돌려주는 fallback 의향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackIntent {
    /// fallback 모델로 즉시 재시도
    Retry,
    /// turn을 여기서 종료
    Stop,
    /// 재인증이 필요함. turn은 종료하고 안내를 남김
    Auth,
}

/// fallback 상담 시 호스트에 전달되는 맥락
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// 쿼터가 소진된 모델
    pub failed_model: String,
    /// 전환 후보 모델
    pub fallback_model: String,
    /// 유발한 오류의 메시지
    pub error: String,
}

/// 호스트 쪽 fallback 의사결정 콜백
pub type FallbackHandler =
    Arc<dyn Fn(FallbackContext) -> BoxFuture<'static, FallbackIntent> + Send + Sync>;

/// fallback 상담 대상인지 판정
///
/// OAuth 개인 계정만 대상입니다. API key나 Vertex 과금 계정은 쿼터
/// 모델이 달라 전환이 의미가 없고, 이미 fallback 모델로 돌고 있으면
/// 더 내려갈 곳이 없습니다.
pub fn is_fallback_eligible(
    auth_kind: AuthKind,
    current_model: &str,
    fallback_model: &str,
) -> bool {
    auth_kind == AuthKind::OauthPersonal && current_model != fallback_model
}
