//! 스트리밍 텍스트에서 inline function call 추출
//!
//! 모델이 네이티브 functionCall part 대신 본문 텍스트에 JSON으로 call을
//! 흘려보내는 경우를 다룹니다. chunk 경계와 무관하게 증분 파싱하고,
//! call이 아닌 텍스트는 그대로 통과시킵니다.

use serde_json::Value;

/// call 후보 감지용 sentinel. 버퍼가 이 문자열로 끝나는 순간 capture를 시작합니다.
const CALL_MARKER: &str = "\"functionCall\"";

/// capture 후보로 붙들어 둘 수 있는 스캔 버퍼의 상한 (bytes). 초과분은
/// 오래된 쪽부터 평문으로 방출되므로 메모리가 chunk 수에 비례해 늘지 않습니다.
const LOOKBACK_BOUND: usize = 1024;

/// 구조 검증을 통과한 function call
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub name: String,
    pub args: Value,
    pub id: Option<String>,
}

/// `feed` 한 번의 결과. `text`는 call로 소비되지 않은 부분의 순서 보존 연결입니다.
#[derive(Debug, Default)]
pub struct ExtractResult {
    pub calls: Vec<ParsedCall>,
    pub text: String,
}

impl ExtractResult {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.text.is_empty()
    }
}

// ============================================================================
// 누적 상태
// ============================================================================

#[derive(Debug)]
struct AccumulatorState {
    buffer: String,
    capturing: bool,
    brace_depth: i32,
    in_string: bool,
    escaped: bool,
}

impl AccumulatorState {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            capturing: false,
            brace_depth: 0,
            in_string: false,
            escaped: false,
        }
    }
}

/// 증분 function call 추출기
///
/// chunk가 어디서 쪼개져도 동작합니다. sentinel이 두 chunk에 걸쳐
/// 있어도, call JSON이 여러 chunk에 나뉘어 와도 결과는 같습니다.
pub struct FunctionCallExtractor {
    state: AccumulatorState,
}

impl Default for FunctionCallExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionCallExtractor {
    pub fn new() -> Self {
        Self {
            state: AccumulatorState::new(),
        }
    }

    /// chunk 하나를 소화하고 완성된 call과 통과 텍스트를 돌려줍니다.
    ///
    /// call 후보가 될 수 없는 텍스트는 다음 chunk를 기다리지 않고 이번
    /// 결과로 바로 나갑니다. 버퍼에는 짝 없는 `{` 이후 구간과 경계에
    /// 걸린 sentinel 조각만 남습니다.
    pub fn feed(&mut self, chunk: &str) -> ExtractResult {
        let mut result = ExtractResult::default();

        for ch in chunk.chars() {
            if self.state.capturing {
                self.consume_capturing(ch, &mut result);
            } else {
                self.consume_scanning(ch, &mut result);
            }
        }

        if !self.state.capturing {
            self.drain_settled_text(&mut result);
        }

        result
    }

    /// 스트림 종료. 남은 평문은 방출하고, 미완성 capture는 경고만 남기고 버립니다.
    pub fn flush(&mut self) -> ExtractResult {
        let mut result = ExtractResult::default();

        if self.state.capturing {
            tracing::warn!(
                buffered = self.state.buffer.len(),
                depth = self.state.brace_depth,
                "dropping incomplete function call capture at stream end"
            );
        } else {
            result.text.push_str(&self.state.buffer);
        }

        self.reset();
        result
    }

    /// 상태 초기화. turn 재시도 시 이전 attempt의 잔여물이 섞이지 않게 합니다.
    pub fn reset(&mut self) {
        self.state = AccumulatorState::new();
    }

    // ------------------------------------------------------------------
    // 스캔 모드: sentinel을 찾을 때까지 평문으로 취급
    // ------------------------------------------------------------------

    fn consume_scanning(&mut self, ch: char, result: &mut ExtractResult) {
        self.state.buffer.push(ch);

        if self.state.buffer.ends_with(CALL_MARKER) {
            let marker_start = self.state.buffer.len() - CALL_MARKER.len();
            if let Some(open) = find_unmatched_open_brace(&self.state.buffer[..marker_start]) {
                // open brace 앞은 평문, 그 뒤부터는 call 후보
                result.text.push_str(&self.state.buffer[..open]);
                let captured = self.state.buffer.split_off(open);
                self.state.buffer = captured;
                self.state.capturing = true;
                self.state.brace_depth = 1;
                self.state.in_string = false;
                self.state.escaped = false;
                return;
            }
            // 여는 brace가 없으면 call일 수 없으므로 계속 평문으로 취급
        }

        if self.state.buffer.len() > LOOKBACK_BOUND {
            let excess = self.state.buffer.len() - LOOKBACK_BOUND;
            let cut = char_boundary_at_or_after(&self.state.buffer, excess);
            result.text.push_str(&self.state.buffer[..cut]);
            let kept = self.state.buffer.split_off(cut);
            self.state.buffer = kept;
        }
    }

    /// 아직 capture 후보가 될 수 있는 꼬리만 남기고 나머지를 방출합니다.
    ///
    /// 가장 이른 짝 없는 `{` 앞의 텍스트는 어떤 미래 sentinel도 capture
    /// 시작점으로 삼을 수 없습니다. 짝 없는 `{`가 없으면 sentinel의
    /// 접두사가 될 수 있는 접미사만 붙들어 둡니다.
    fn drain_settled_text(&mut self, result: &mut ExtractResult) {
        let keep_from = match earliest_unmatched_open_brace(&self.state.buffer) {
            Some(idx) => idx,
            None => self.state.buffer.len() - marker_prefix_suffix_len(&self.state.buffer),
        };
        if keep_from > 0 {
            result.text.push_str(&self.state.buffer[..keep_from]);
            let kept = self.state.buffer.split_off(keep_from);
            self.state.buffer = kept;
        }
    }

    // ------------------------------------------------------------------
    // capture 모드: brace 균형이 맞을 때까지 누적
    // ------------------------------------------------------------------

    fn consume_capturing(&mut self, ch: char, result: &mut ExtractResult) {
        self.state.buffer.push(ch);

        if self.state.escaped {
            self.state.escaped = false;
            return;
        }

        match ch {
            '\\' if self.state.in_string => self.state.escaped = true,
            '"' => self.state.in_string = !self.state.in_string,
            '{' if !self.state.in_string => self.state.brace_depth += 1,
            '}' if !self.state.in_string => {
                self.state.brace_depth -= 1;
                if self.state.brace_depth == 0 {
                    self.finish_capture(result);
                }
            }
            _ => {}
        }
    }

    fn finish_capture(&mut self, result: &mut ExtractResult) {
        let candidate = std::mem::take(&mut self.state.buffer);
        self.state.capturing = false;

        match parse_call(&candidate) {
            Some(call) => {
                tracing::debug!(name = %call.name, "extracted inline function call");
                result.calls.push(call);
            }
            None => {
                // call 모양이 아니면 원문 그대로 통과
                result.text.push_str(&candidate);
            }
        }
    }
}

// ============================================================================
// 구조 검증
// ============================================================================

/// brace 균형이 맞는 후보를 call로 인정할지 판정
///
/// `{"functionCall": {"name": "...", "args": {...}, "id": "..."}}` 꼴만
/// 통과합니다. args는 생략 시 빈 객체, id는 선택입니다.
fn parse_call(candidate: &str) -> Option<ParsedCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let call = value.get("functionCall")?.as_object()?;
    let name = call.get("name")?.as_str()?.to_string();

    let args = match call.get("args") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return None, // args가 객체가 아니면 call이 아님
    };

    let id = call
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Some(ParsedCall { name, args, id })
}

/// sentinel 앞쪽에서 가장 가까운 짝 없는 `{`의 byte offset을 찾습니다.
fn find_unmatched_open_brace(prefix: &str) -> Option<usize> {
    let mut closed = 0u32;
    for (idx, ch) in prefix.char_indices().rev() {
        match ch {
            '}' => closed += 1,
            '{' => {
                if closed == 0 {
                    return Some(idx);
                }
                closed -= 1;
            }
            _ => {}
        }
    }
    None
}

/// 버퍼 전체를 앞에서 훑어 가장 이른 짝 없는 `{`의 byte offset을 찾습니다.
fn earliest_unmatched_open_brace(s: &str) -> Option<usize> {
    let mut open: Vec<usize> = Vec::new();
    for (idx, ch) in s.char_indices() {
        match ch {
            '{' => open.push(idx),
            '}' => {
                open.pop();
            }
            _ => {}
        }
    }
    open.first().copied()
}

/// sentinel의 접두사가 될 수 있는 가장 긴 버퍼 접미사의 길이 (bytes)
fn marker_prefix_suffix_len(s: &str) -> usize {
    let max = CALL_MARKER.len().min(s.len());
    for len in (1..=max).rev() {
        if s.is_char_boundary(s.len() - len) && CALL_MARKER.starts_with(&s[s.len() - len..]) {
            return len;
        }
    }
    0
}

fn char_boundary_at_or_after(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed_all(extractor: &mut FunctionCallExtractor, chunks: &[&str]) -> ExtractResult {
        let mut total = ExtractResult::default();
        for chunk in chunks {
            let part = extractor.feed(chunk);
            total.calls.extend(part.calls);
            total.text.push_str(&part.text);
        }
        let tail = extractor.flush();
        total.calls.extend(tail.calls);
        total.text.push_str(&tail.text);
        total
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(&mut extractor, &["hello ", "world"]);
        assert!(result.calls.is_empty());
        assert_eq!(result.text, "hello world");
    }

    #[test]
    fn test_single_call_in_one_chunk() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "read_file", "args": {"path": "a.txt"}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].name, "read_file");
        assert_eq!(result.calls[0].args, json!({"path": "a.txt"}));
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_call_split_across_chunks() {
        let mut extractor = FunctionCallExtractor::new();
        // sentinel 자체가 chunk 경계에 걸침
        let result = feed_all(
            &mut extractor,
            &[
                r#"{"function"#,
                r#"Call": {"name": "ls", "#,
                r#""args": {}}}"#,
            ],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].name, "ls");
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_text_around_call_preserved() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"before {"functionCall": {"name": "f", "args": {}}} after"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.text, "before  after");
    }

    #[test]
    fn test_braces_in_string_values() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "w", "args": {"body": "if (x) { y(); }"}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args["body"], "if (x) { y(); }");
    }

    #[test]
    fn test_escaped_quote_does_not_close_string() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "w", "args": {"s": "say \"hi\" {now}"}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args["s"], "say \"hi\" {now}");
    }

    #[test]
    fn test_unicode_escape_in_captured_string() {
        let mut extractor = FunctionCallExtractor::new();
        // \u007b 는 `{` 로 디코드되지만 문자열 안 escape라 depth에 영향이 없어야 함
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "w", "args": {"s": "open \u007b close \u007d"}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args["s"], "open { close }");
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_double_backslash_then_quote_closes_string() {
        let mut extractor = FunctionCallExtractor::new();
        // \\" 는 backslash 하나 + 문자열 종료
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "w", "args": {"p": "C:\\"}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args["p"], "C:\\");
    }

    #[test]
    fn test_mention_without_call_shape_passes_through() {
        let mut extractor = FunctionCallExtractor::new();
        // brace 균형은 맞지만 name이 없으므로 call이 아님
        let input = r#"{"functionCall": "just a string"}"#;
        let result = feed_all(&mut extractor, &[input]);
        assert!(result.calls.is_empty());
        assert_eq!(result.text, input);
    }

    #[test]
    fn test_marker_without_open_brace_is_text() {
        let mut extractor = FunctionCallExtractor::new();
        let input = r#"the "functionCall" field is documented here"#;
        let result = feed_all(&mut extractor, &[input]);
        assert!(result.calls.is_empty());
        assert_eq!(result.text, input);
    }

    #[test]
    fn test_missing_args_defaults_to_empty_object() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(&mut extractor, &[r#"{"functionCall": {"name": "noop"}}"#]);
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args, json!({}));
    }

    #[test]
    fn test_call_id_carried_through() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "f", "args": {}, "id": "call-7"}}"#],
        );
        assert_eq!(result.calls[0].id.as_deref(), Some("call-7"));
    }

    #[test]
    fn test_incomplete_capture_dropped_on_flush() {
        let mut extractor = FunctionCallExtractor::new();
        let mid = extractor.feed(r#"{"functionCall": {"name": "f", "args": {"#);
        assert!(mid.is_empty());
        let tail = extractor.flush();
        assert!(tail.calls.is_empty());
        assert!(tail.text.is_empty());
    }

    #[test]
    fn test_two_calls_back_to_back() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[
                r#"{"functionCall": {"name": "a", "args": {}}}"#,
                r#"{"functionCall": {"name": "b", "args": {}}}"#,
            ],
        );
        assert_eq!(result.calls.len(), 2);
        assert_eq!(result.calls[0].name, "a");
        assert_eq!(result.calls[1].name, "b");
    }

    #[test]
    fn test_each_feed_returns_its_own_text() {
        let mut extractor = FunctionCallExtractor::new();
        // 평문은 다음 chunk를 기다리지 않고 feed마다 바로 나옴
        assert_eq!(extractor.feed("hello ").text, "hello ");
        assert_eq!(extractor.feed("world").text, "world");
        assert!(extractor.flush().is_empty());
    }

    #[test]
    fn test_partial_sentinel_held_until_resolved() {
        let mut extractor = FunctionCallExtractor::new();
        // 경계에 걸린 sentinel 조각은 판정이 날 때까지만 붙들어 둠
        let first = extractor.feed(r#"say {"function"#);
        assert_eq!(first.text, "say ");
        let second = extractor.feed(r#"Call": {"name": "f", "args": {}}}"#);
        assert_eq!(second.calls.len(), 1);
        assert_eq!(second.calls[0].name, "f");
        assert!(second.text.is_empty());
    }

    #[test]
    fn test_lookback_bound_evicts_stale_open_brace() {
        let mut extractor = FunctionCallExtractor::new();
        let long = format!("{{{}", "x".repeat(LOOKBACK_BOUND + 100));
        let first = extractor.feed(&long);
        // 짝 없는 `{`가 상한 밖으로 밀려나 전부 평문으로 확정됨
        assert_eq!(first.text.len(), long.len());

        // 밀려난 `{`는 더 이상 capture 시작점이 될 수 없음
        let tail = r#""functionCall": {"name": "f", "args": {}}}"#;
        let second = extractor.feed(tail);
        let rest = extractor.flush();
        assert!(second.calls.is_empty() && rest.calls.is_empty());
        assert_eq!(format!("{}{}", second.text, rest.text), tail);
    }

    #[test]
    fn test_reset_clears_partial_capture() {
        let mut extractor = FunctionCallExtractor::new();
        extractor.feed(r#"{"functionCall": {"name": "f""#);
        extractor.reset();
        let result = feed_all(&mut extractor, &["clean slate"]);
        assert!(result.calls.is_empty());
        assert_eq!(result.text, "clean slate");
    }

    #[test]
    fn test_single_chunk_and_char_chunks_agree() {
        let input = r#"prefix {"functionCall": {"name": "f", "args": {}}} suffix"#;

        let mut whole = FunctionCallExtractor::new();
        let whole_result = feed_all(&mut whole, &[input]);

        let mut char_chunks = FunctionCallExtractor::new();
        let pieces: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = pieces.iter().map(|s| s.as_str()).collect();
        let char_result = feed_all(&mut char_chunks, &refs);

        assert_eq!(whole_result.calls, char_result.calls);
        assert_eq!(whole_result.text, char_result.text);
        assert_eq!(char_result.text, "prefix  suffix");
        assert_eq!(char_result.calls[0].name, "f");
    }

    #[test]
    fn test_nested_args_object() {
        let mut extractor = FunctionCallExtractor::new();
        let result = feed_all(
            &mut extractor,
            &[r#"{"functionCall": {"name": "edit", "args": {"change": {"old": "a", "new": "b"}}}}"#],
        );
        assert_eq!(result.calls.len(), 1);
        assert_eq!(result.calls[0].args["change"]["new"], "b");
    }
}
