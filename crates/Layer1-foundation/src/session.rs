//! Session State - 세션 수명 동안 유지되는 상태
//!
//! 턴 엔진이 읽고 갱신하는 세션 소유 상태:
//! - FallbackState: 할당량 초과 후 폴백 모델로 전환하는 one-way latch
//! - non-interactive 플래그 (확인 프롬프트에 답할 사람이 없는 모드)
//! - 텔레메트리 훅 (폴백 첫 진입 시 1회 발화)
//!
//! 세션 간 공유 상태는 없습니다. 프로세스가 세션을 여러 개 관리하면
//! 각 세션이 자신의 `Session`을 소유합니다 (전역 싱글톤 금지).

use crate::config::AuthKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// 폴백 상태
///
/// 불변 조건: `is_in_fallback_mode`는 한번 true가 되면 명시적 세션
/// 리셋 외에는 false로 돌아가지 않습니다.
#[derive(Debug, Clone)]
pub struct FallbackState {
    /// 현재 활성 모델
    pub active_model: String,

    /// 폴백 모드 latch
    pub is_in_fallback_mode: bool,
}

/// 세션 텔레메트리 이벤트
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// 폴백 모드 첫 진입 (세션당 최대 1회)
    FallbackActivated {
        auth_kind: AuthKind,
        timestamp: DateTime<Utc>,
    },
}

/// Fire-and-forget 텔레메트리 훅
pub type TelemetryHook = Arc<dyn Fn(TelemetryEvent) + Send + Sync>;

/// 턴 엔진이 참조하는 세션 객체
pub struct Session {
    fallback: Mutex<FallbackState>,

    /// 폴백 시 사용할 모델
    fallback_model: String,

    /// 확인 프롬프트를 띄울 수 없는 모드
    non_interactive: bool,

    /// 사용 통계 수집 동의 여부
    usage_statistics_enabled: bool,

    /// 개인정보 보호 설치 식별자 (사용 통계 활성 시 헤더로 첨부)
    installation_id: Option<String>,

    telemetry: Option<TelemetryHook>,
}

impl Session {
    pub fn new(active_model: impl Into<String>) -> Self {
        Self {
            fallback: Mutex::new(FallbackState {
                active_model: active_model.into(),
                is_in_fallback_mode: false,
            }),
            fallback_model: crate::config::DEFAULT_FALLBACK_MODEL.to_string(),
            non_interactive: false,
            usage_statistics_enabled: false,
            installation_id: None,
            telemetry: None,
        }
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = model.into();
        self
    }

    pub fn with_non_interactive(mut self, non_interactive: bool) -> Self {
        self.non_interactive = non_interactive;
        self
    }

    pub fn with_usage_statistics(mut self, enabled: bool) -> Self {
        self.usage_statistics_enabled = enabled;
        self
    }

    pub fn with_installation_id(mut self, id: impl Into<String>) -> Self {
        self.installation_id = Some(id.into());
        self
    }

    pub fn with_telemetry_hook(mut self, hook: TelemetryHook) -> Self {
        self.telemetry = Some(hook);
        self
    }

    pub fn non_interactive(&self) -> bool {
        self.non_interactive
    }

    pub fn usage_statistics_enabled(&self) -> bool {
        self.usage_statistics_enabled
    }

    pub fn installation_id(&self) -> Option<&str> {
        self.installation_id.as_deref()
    }

    pub fn fallback_model(&self) -> &str {
        &self.fallback_model
    }

    /// 폴백 latch를 고려한 실효 모델
    pub fn effective_model(&self) -> String {
        let state = self.fallback.lock();
        if state.is_in_fallback_mode {
            self.fallback_model.clone()
        } else {
            state.active_model.clone()
        }
    }

    pub fn is_in_fallback_mode(&self) -> bool {
        self.fallback.lock().is_in_fallback_mode
    }

    /// 폴백 모드 진입 (멱등)
    ///
    /// 이미 활성이면 상태 변경도 텔레메트리 발화도 없습니다.
    /// 첫 활성화였는지를 반환합니다.
    pub fn enter_fallback_mode(&self, auth_kind: AuthKind) -> bool {
        let first = {
            let mut state = self.fallback.lock();
            if state.is_in_fallback_mode {
                false
            } else {
                state.is_in_fallback_mode = true;
                true
            }
        };

        if first {
            tracing::info!(auth_kind = %auth_kind, "entering fallback mode");
            if let Some(hook) = &self.telemetry {
                hook(TelemetryEvent::FallbackActivated {
                    auth_kind,
                    timestamp: Utc::now(),
                });
            }
        }

        first
    }

    /// 명시적 세션 리셋 (latch 해제의 유일한 경로)
    pub fn reset(&self, active_model: impl Into<String>) {
        let mut state = self.fallback.lock();
        state.active_model = active_model.into();
        state.is_in_fallback_mode = false;
    }
}
