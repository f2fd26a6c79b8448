//! Request/Response 공통 타입
//!
//! 모든 backend 전략이 공유하는 제네릭 요청/응답 형태입니다. 각 전략은
//! 이 타입을 자기 vendor의 wire 형태로 독립적으로 변형합니다
//! (generate 시 요청 shaping, 응답 reshaping).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// 요청 타입
// ============================================================================

/// 대화의 한 항목
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// "user" | "model" | "function"
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part::text(text)],
        }
    }

    pub fn function_response(name: impl Into<String>, response: Value) -> Self {
        Self {
            role: "function".to_string(),
            parts: vec![Part::FunctionResponse {
                function_response: FunctionResponsePart {
                    name: name.into(),
                    response,
                },
            }],
        }
    }
}

/// Content의 구성 요소
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCallPart,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponsePart,
    },
    Text {
        text: String,
        /// 모델 추론(thinking) 출력 표시
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: None,
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            thought: Some(true),
        }
    }

    pub fn is_thought(&self) -> bool {
        matches!(
            self,
            Part::Text {
                thought: Some(true),
                ..
            }
        )
    }
}

/// 모델이 요청한 함수 호출
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// 함수 실행 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponsePart {
    pub name: String,
    pub response: Value,
}

/// 도구 정의
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema
    pub parameters: Value,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// 생성 파라미터
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// 구조화 출력 요청 시 "application/json"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    /// 구조화 출력 JSON Schema
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

/// 제네릭 생성 요청
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// 모델 override (없으면 backend 설정의 모델 사용)
    ///
    /// 폴백 latch 이후의 재시도가 낮아진 실효 모델을 여기로 전달합니다.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::user(prompt)],
            ..Default::default()
        }
    }

    /// 구조화 출력을 요청했는지
    pub fn wants_structured_output(&self) -> bool {
        self.generation_config
            .as_ref()
            .is_some_and(|c| c.response_schema.is_some())
    }

    /// 요청 전체의 문자 수 (토큰 추정용)
    pub fn char_count(&self) -> usize {
        let mut chars = self.system_instruction.as_deref().unwrap_or("").len();
        for content in &self.contents {
            for part in &content.parts {
                chars += match part {
                    Part::Text { text, .. } => text.len(),
                    Part::FunctionCall { function_call } => {
                        function_call.name.len() + function_call.args.to_string().len()
                    }
                    Part::FunctionResponse { function_response } => {
                        function_response.name.len()
                            + function_response.response.to_string().len()
                    }
                };
            }
        }
        for tool in &self.tools {
            chars += tool.name.len() + tool.description.len() + tool.parameters.to_string().len();
        }
        chars
    }
}

// ============================================================================
// 응답 타입
// ============================================================================

/// 토큰 사용량
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub candidate_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// 응답 후보
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// 완결 응답
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetadata>,
}

/// 스트림 청크 (완결 응답과 같은 모양의 증분)
pub type ResponseChunk = GenerateResponse;

impl GenerateResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Some(Content::model(text)),
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// 첫 후보의 parts (없으면 빈 슬라이스)
    pub fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    /// 첫 후보의 일반 텍스트를 이어붙인 결과 (thought 제외)
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in self.parts() {
            if let Part::Text {
                text,
                thought: None | Some(false),
            } = part
            {
                out.push_str(text);
            }
        }
        out
    }

    /// 첫 후보의 함수 호출들
    pub fn function_calls(&self) -> Vec<&FunctionCallPart> {
        self.parts()
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { function_call } => Some(function_call),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// 토큰 계산 / 임베딩
// ============================================================================

/// 토큰 계산 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub total: u32,

    /// 정확한 값이 아니라 추정치인지
    pub is_estimate: bool,
}

impl TokenCount {
    pub fn exact(total: u32) -> Self {
        Self {
            total,
            is_estimate: false,
        }
    }

    pub fn estimate(total: u32) -> Self {
        Self {
            total,
            is_estimate: true,
        }
    }
}

/// 임베딩 요청
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub texts: Vec<String>,
}

/// 임베딩 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_untagged_roundtrip() {
        let json = json!({"functionCall": {"name": "read_file", "args": {"path": "a.txt"}}});
        let part: Part = serde_json::from_value(json).unwrap();
        match part {
            Part::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "read_file");
                assert_eq!(function_call.args["path"], "a.txt");
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn test_response_text_skips_thoughts() {
        let response = GenerateResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: "model".to_string(),
                    parts: vec![Part::thought("planning"), Part::text("hello")],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage: None,
        };
        assert_eq!(response.text(), "hello");
    }

    #[test]
    fn test_char_count_includes_tools_and_system() {
        let mut request = GenerateRequest::from_prompt("abcd");
        request.system_instruction = Some("ef".to_string());
        request
            .tools
            .push(ToolDef::new("t", "d", json!({})));
        assert!(request.char_count() >= 8);
    }

    #[test]
    fn test_wants_structured_output() {
        let mut request = GenerateRequest::from_prompt("x");
        assert!(!request.wants_structured_output());
        request.generation_config = Some(GenerationConfig {
            response_schema: Some(json!({"type": "object"})),
            ..Default::default()
        });
        assert!(request.wants_structured_output());
    }
}
