//! Tool call 정책 엔진
//!
//! function call을 실행 요청으로 내보내기 전에 우선순위 규칙표와
//! 대조합니다. 규칙은 tool 이름과 인자 패턴으로 매칭되며, 같은
//! 우선순위끼리는 추가 순서를 유지합니다.

use crate::extractor::ParsedCall;
use ember_foundation::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 규칙 평가 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    AskUser,
    Deny,
}

/// 정책 규칙 하나
///
/// `tool_name`이 `None`이면 모든 tool에, `args_pattern`이 `None`이면
/// 모든 인자에 매칭됩니다. 패턴이 있는데 인자가 비어 있으면 절대
/// 매칭되지 않습니다.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub tool_name: Option<String>,
    pub args_pattern: Option<Regex>,
    pub decision: PolicyDecision,
    pub priority: i32,
}

impl PolicyRule {
    pub fn for_tool(name: impl Into<String>, decision: PolicyDecision, priority: i32) -> Self {
        Self {
            tool_name: Some(name.into()),
            args_pattern: None,
            decision,
            priority,
        }
    }

    pub fn wildcard(decision: PolicyDecision, priority: i32) -> Self {
        Self {
            tool_name: None,
            args_pattern: None,
            decision,
            priority,
        }
    }

    pub fn with_args_pattern(mut self, pattern: Regex) -> Self {
        self.args_pattern = Some(pattern);
        self
    }

    fn matches(&self, call: &ParsedCall, canonical_args: &Option<String>) -> bool {
        if let Some(name) = &self.tool_name {
            if name != &call.name {
                return false;
            }
        }
        if let Some(pattern) = &self.args_pattern {
            match canonical_args {
                Some(args) => return pattern.is_match(args),
                // 인자가 없거나 빈 객체면 패턴 규칙은 매칭 불가
                None => return false,
            }
        }
        true
    }
}

// ============================================================================
// 직렬화 가능한 규칙 정의 (설정 파일 로딩용)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub args_pattern: Option<String>,
    pub decision: PolicyDecision,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
    #[serde(default = "default_decision")]
    pub default_decision: PolicyDecision,
    #[serde(default)]
    pub non_interactive: bool,
}

fn default_decision() -> PolicyDecision {
    PolicyDecision::AskUser
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_decision: default_decision(),
            non_interactive: false,
        }
    }
}

// ============================================================================
// 엔진
// ============================================================================

/// 우선순위 정렬 규칙표를 들고 call마다 판정을 내립니다.
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    default_decision: PolicyDecision,
    non_interactive: bool,
}

impl PolicyEngine {
    pub fn new(default_decision: PolicyDecision, non_interactive: bool) -> Self {
        Self {
            rules: Vec::new(),
            default_decision,
            non_interactive,
        }
    }

    /// 설정에서 구성. 잘못된 정규식은 여기서 바로 실패합니다.
    pub fn from_config(config: &PolicyConfig) -> Result<Self> {
        let mut engine = Self::new(config.default_decision, config.non_interactive);
        for rule in &config.rules {
            let compiled = match &rule.args_pattern {
                Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                    Error::Config(format!("bad args pattern {:?}: {}", pattern, e))
                })?),
                None => None,
            };
            engine.add_rule(PolicyRule {
                tool_name: rule.tool_name.clone(),
                args_pattern: compiled,
                decision: rule.decision,
                priority: rule.priority,
            });
        }
        Ok(engine)
    }

    /// 규칙 추가. 표는 항상 우선순위 내림차순, 동순위는 추가 순서 유지.
    pub fn add_rule(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// 특정 tool 이름을 가진 규칙 제거. wildcard 규칙은 남습니다.
    pub fn remove_rules_for_tool(&mut self, name: &str) {
        self.rules.retain(|r| r.tool_name.as_deref() != Some(name));
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// call 하나를 판정합니다. 첫 매칭 규칙이 이기고, 매칭이 없으면
    /// 기본 판정입니다. 비대화형 세션에서는 AskUser가 Deny로 강등됩니다.
    pub fn check(&self, call: &ParsedCall) -> PolicyDecision {
        // 패턴 규칙이 하나라도 있을 때만 정규화 비용을 치름
        let canonical_args = if self.rules.iter().any(|r| r.args_pattern.is_some()) {
            canonicalize_args(&call.args)
        } else {
            None
        };

        let decision = self
            .rules
            .iter()
            .find(|rule| rule.matches(call, &canonical_args))
            .map(|rule| rule.decision)
            .unwrap_or(self.default_decision);

        let decision = if self.non_interactive && decision == PolicyDecision::AskUser {
            tracing::debug!(tool = %call.name, "ask_user coerced to deny in non-interactive session");
            PolicyDecision::Deny
        } else {
            decision
        };

        tracing::debug!(tool = %call.name, ?decision, "policy check");
        decision
    }
}

/// 인자를 키 정렬된 canonical JSON 문자열로 만듭니다.
///
/// 같은 인자는 키 순서와 무관하게 같은 문자열이 되어야 패턴 매칭이
/// 결정적입니다. 빈 객체나 null은 `None`입니다.
fn canonicalize_args(args: &Value) -> Option<String> {
    match args {
        Value::Object(map) if !map.is_empty() => Some(canonical_json(args)),
        _ => None,
    }
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, canonical_json(v)))
                .collect();
            let inner: Vec<String> = sorted
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), v))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
