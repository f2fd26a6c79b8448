//! Stream Event - 턴 실행의 유일한 출력 계약
//!
//! Turn controller만 이 이벤트를 생산합니다. 한 턴 안에서의 순서가
//! 의미를 가지므로 소비자는 `Content`와 tool call 이벤트의 상대 순서를
//! 바꾸면 안 됩니다.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 턴 실행 중 방출되는 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 모델 텍스트 출력
    Content { text: String },

    /// 모델 추론 (thinking) 내용
    Thought {
        subject: String,
        description: String,
    },

    /// 도구 호출 요청 (실행은 외부 executor 소관)
    ToolCallRequest {
        id: String,
        name: String,
        args: Value,
    },

    /// 도구 호출 응답 (거부/실패 시 error 포함)
    ToolCallResponse {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// 턴을 종료시키는 에러
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn error(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Error {
            message: message.into(),
            status,
        }
    }

    /// Thought 텍스트에서 `**subject**` 마커를 분리
    ///
    /// 마커가 없으면 subject는 비고 전체가 description이 됩니다.
    pub fn thought_from_text(raw: &str) -> Self {
        if let Some(rest) = raw.trim_start().strip_prefix("**") {
            if let Some(end) = rest.find("**") {
                let subject = rest[..end].trim().to_string();
                let description = rest[end + 2..].trim().to_string();
                return Self::Thought {
                    subject,
                    description,
                };
            }
        }
        Self::Thought {
            subject: String::new(),
            description: raw.trim().to_string(),
        }
    }
}
