//! # ember-foundation
//!
//! Foundation layer for EmberCode:
//! - Error: 중앙 에러 타입 (Error, Result)
//! - Config: Backend 설정 (BackendConfig, AuthKind)
//! - Session: 세션 상태 (FallbackState latch, 텔레메트리 훅)
//! - Event: 턴 출력 계약 (StreamEvent)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Turn Controller (Layer3)                   │
//! │        │ StreamEvent                        │
//! │        ▼                                    │
//! │  Backend Adapter (Layer2)                   │
//! │        │ BackendConfig / Session            │
//! │        ▼                                    │
//! │  Foundation (이 crate)                      │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod session;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{AuthKind, BackendConfig, DEFAULT_FALLBACK_MODEL, DEFAULT_MODEL};

// ============================================================================
// Session (세션 상태)
// ============================================================================
pub use session::{FallbackState, Session, TelemetryEvent, TelemetryHook};

// ============================================================================
// Event (턴 출력)
// ============================================================================
pub use event::StreamEvent;
