//! # ember-turn
//!
//! Turn 실행 코어. backend 스트림 하나를 소비해 이벤트 스트림 하나를
//! 생산하는 전 과정을 담당합니다.
//!
//! ## Features
//! - 텍스트에 숨은 function call의 증분 추출 (chunk 경계 무관)
//! - 우선순위 규칙 기반 tool call 정책 판정
//! - 쿼터 소진 시 모델 fallback 프로토콜 (세션당 1회 래치)
//! - CancellationToken 협조 취소

pub mod extractor;
pub mod fallback;
pub mod policy;
pub mod turn;

// Extraction
pub use extractor::{ExtractResult, FunctionCallExtractor, ParsedCall};

// Policy
pub use policy::{PolicyConfig, PolicyDecision, PolicyEngine, PolicyRule, PolicyRuleConfig};

// Fallback protocol
pub use fallback::{
    is_fallback_eligible, FallbackContext, FallbackHandler, FallbackIntent,
};

// Controller
pub use turn::{ConfirmationHandler, Turn, TurnState};
