//! Turn controller
//!
//! 프롬프트 하나를 완료까지 끌고 가는 실행 단위입니다. backend 스트림을
//! 소비하면서 [`StreamEvent`]를 생산하고, 텍스트에 숨은 function call을
//! 추출하고, call마다 정책 판정을 거치고, 쿼터 소진 시 fallback
//! 프로토콜을 돌립니다. 이벤트는 생산 즉시 방출되며 턴 종료까지
//! 버퍼링하지 않습니다.

use crate::extractor::{ExtractResult, FunctionCallExtractor, ParsedCall};
use crate::fallback::{is_fallback_eligible, FallbackContext, FallbackHandler, FallbackIntent};
use crate::policy::{PolicyDecision, PolicyEngine};
use async_stream::stream;
use ember_backend::{
    BackendError, ContentGenerator, GenerateRequest, GenerateResponse, Part, QuotaDirective,
    RetryClassification, RetryConfig, RetryableError,
};
use ember_foundation::{AuthKind, Result, Session, StreamEvent};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// AskUser 판정 시 호출되는 확인 콜백. `true`면 승인입니다.
pub type ConfirmationHandler = Arc<dyn Fn(ParsedCall) -> BoxFuture<'static, bool> + Send + Sync>;

/// 턴의 수명 주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Requesting,
    Streaming,
    FallbackRetry,
    Completed,
    Failed,
}

/// 턴 실행기
///
/// 세션 하나가 턴을 여러 개 순차 실행할 수 있고, 프로세스가 세션을
/// 여러 개 들고 있어도 서로 간섭하지 않습니다.
pub struct Turn {
    generator: Arc<dyn ContentGenerator>,
    session: Arc<Session>,
    auth_kind: AuthKind,
    policy: PolicyEngine,
    retry_config: RetryConfig,
    fallback_handler: Option<FallbackHandler>,
    confirmation_handler: Option<ConfirmationHandler>,
    state: Mutex<TurnState>,
}

impl Turn {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        session: Arc<Session>,
        auth_kind: AuthKind,
        policy: PolicyEngine,
    ) -> Self {
        Self {
            generator,
            session,
            auth_kind,
            policy,
            retry_config: RetryConfig::default(),
            fallback_handler: None,
            confirmation_handler: None,
            state: Mutex::new(TurnState::Requesting),
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_fallback_handler(mut self, handler: FallbackHandler) -> Self {
        self.fallback_handler = Some(handler);
        self
    }

    pub fn with_confirmation_handler(mut self, handler: ConfirmationHandler) -> Self {
        self.confirmation_handler = Some(handler);
        self
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    /// 턴 실행. 이벤트를 생산 순서대로 내보내는 lazy stream을 돌려줍니다.
    ///
    /// 재시도는 첫 chunk가 나오기 전의 실패에만 적용됩니다. 이미 방출한
    /// 이벤트를 되돌릴 수 없으므로, 중간 실패는 Error 이벤트로 끝납니다.
    pub fn run(
        &self,
        request: GenerateRequest,
        prompt_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = StreamEvent> + Send + '_>> {
        let prompt_id = prompt_id.into();

        Box::pin(stream! {
            let mut extractor = FunctionCallExtractor::new();
            let mut attempt: u32 = 0;

            'attempts: loop {
                *self.state.lock() = TurnState::Requesting;

                let mut req = request.clone();
                req.model = Some(self.session.effective_model());

                tracing::debug!(
                    prompt_id = %prompt_id,
                    model = req.model.as_deref().unwrap_or(""),
                    attempt,
                    "starting turn attempt"
                );

                let mut chunks = self.generator.generate_stream(req, &prompt_id);
                let mut yielded_any = false;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::debug!(prompt_id = %prompt_id, "turn cancelled");
                            *self.state.lock() = TurnState::Failed;
                            return;
                        }
                        next = chunks.next() => next,
                    };

                    match next {
                        None => {
                            // 스트림 정상 종료
                            let ExtractResult { calls, text } = extractor.flush();
                            if !text.is_empty() {
                                yield StreamEvent::content(text);
                            }
                            for call in calls {
                                match self.resolve_call(call, &cancel).await {
                                    Some(event) => yield event,
                                    None => {
                                        *self.state.lock() = TurnState::Failed;
                                        return;
                                    }
                                }
                            }
                            *self.state.lock() = TurnState::Completed;
                            return;
                        }

                        Some(Ok(chunk)) => {
                            *self.state.lock() = TurnState::Streaming;
                            yielded_any = true;

                            for event in self.events_for_chunk(&chunk, &mut extractor) {
                                match event {
                                    PendingEvent::Ready(event) => yield event,
                                    PendingEvent::Call(call) => {
                                        match self.resolve_call(call, &cancel).await {
                                            Some(event) => yield event,
                                            None => {
                                                *self.state.lock() = TurnState::Failed;
                                                return;
                                            }
                                        }
                                    }
                                }
                            }
                        }

                        Some(Err(e)) => {
                            // 출력 전 쿼터 오류는 fallback 상담 대상
                            let consultable = !yielded_any
                                && e.is_quota()
                                && is_fallback_eligible(
                                    self.auth_kind,
                                    &self.session.effective_model(),
                                    self.session.fallback_model(),
                                );

                            if let Some(handler) =
                                consultable.then(|| self.fallback_handler.clone()).flatten()
                            {
                                *self.state.lock() = TurnState::FallbackRetry;
                                let context = FallbackContext {
                                    failed_model: self.session.effective_model(),
                                    fallback_model: self.session.fallback_model().to_string(),
                                    error: e.to_string(),
                                };

                                let intent = tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => {
                                        *self.state.lock() = TurnState::Failed;
                                        return;
                                    }
                                    intent = handler(context) => intent,
                                };

                                match intent {
                                    FallbackIntent::Retry => {
                                        self.session.enter_fallback_mode(self.auth_kind);
                                        tracing::info!(
                                            prompt_id = %prompt_id,
                                            fallback_model = self.session.fallback_model(),
                                            "retrying turn with fallback model"
                                        );
                                        extractor.reset();
                                        attempt = 0;
                                        continue 'attempts;
                                    }
                                    FallbackIntent::Stop => {
                                        self.session.enter_fallback_mode(self.auth_kind);
                                        *self.state.lock() = TurnState::Failed;
                                        yield StreamEvent::error(e.to_string(), e.status());
                                        return;
                                    }
                                    FallbackIntent::Auth => {
                                        *self.state.lock() = TurnState::Failed;
                                        yield StreamEvent::error(
                                            format!("reauthentication required: {}", e),
                                            e.status(),
                                        );
                                        return;
                                    }
                                }
                            }

                            // 일반 재시도 분류 (역시 출력 전에만)
                            if !yielded_any && attempt < self.retry_config.max_retries {
                                let delay = match e.classify() {
                                    RetryClassification::Retry => {
                                        Some(self.retry_config.delay_for_attempt(attempt))
                                    }
                                    RetryClassification::RateLimited { retry_after_ms } => {
                                        Some(retry_after_ms.map(Duration::from_millis).unwrap_or_else(
                                            || self.retry_config.delay_for_attempt(attempt),
                                        ))
                                    }
                                    RetryClassification::NoRetry => None,
                                };

                                if let Some(delay) = delay {
                                    tracing::warn!(
                                        prompt_id = %prompt_id,
                                        attempt,
                                        ?delay,
                                        error = %e,
                                        "turn attempt failed, retrying"
                                    );
                                    tokio::select! {
                                        _ = cancel.cancelled() => {
                                            *self.state.lock() = TurnState::Failed;
                                            return;
                                        }
                                        _ = tokio::time::sleep(delay) => {}
                                    }
                                    attempt += 1;
                                    continue 'attempts;
                                }
                            }

                            *self.state.lock() = TurnState::Failed;
                            yield StreamEvent::error(e.to_string(), e.status());
                            return;
                        }
                    }
                }
            }
        })
    }

    /// 비스트리밍 변형. 정책/추출 없이 완결 응답 하나를 돌려줍니다.
    ///
    /// 구조화 출력 유틸리티 등 이벤트 스트림이 필요 없는 호출용입니다.
    /// 쿼터 상담과 fallback 래치는 스트리밍 경로와 같은 프로토콜을 탑니다.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        prompt_id: &str,
    ) -> Result<GenerateResponse> {
        let response = ember_backend::with_retry_consult(
            &self.retry_config,
            "turn generate",
            |error: &BackendError| {
                let message = error.to_string();
                self.consult_quota(message)
            },
            || {
                let mut req = request.clone();
                req.model = Some(self.session.effective_model());
                self.generator.generate(req, prompt_id)
            },
        )
        .await?;
        Ok(response)
    }

    async fn consult_quota(&self, error_message: String) -> QuotaDirective {
        let Some(handler) = &self.fallback_handler else {
            return QuotaDirective::Continue;
        };
        if !is_fallback_eligible(
            self.auth_kind,
            &self.session.effective_model(),
            self.session.fallback_model(),
        ) {
            return QuotaDirective::Continue;
        }

        let context = FallbackContext {
            failed_model: self.session.effective_model(),
            fallback_model: self.session.fallback_model().to_string(),
            error: error_message,
        };

        match handler(context).await {
            FallbackIntent::Retry => {
                self.session.enter_fallback_mode(self.auth_kind);
                QuotaDirective::Retry
            }
            FallbackIntent::Stop => {
                self.session.enter_fallback_mode(self.auth_kind);
                QuotaDirective::Stop
            }
            FallbackIntent::Auth => QuotaDirective::Stop,
        }
    }

    /// chunk 하나의 part들을 방출 목록으로 변환
    ///
    /// thought는 그대로, 일반 텍스트는 추출기를 거치고, 네이티브
    /// functionCall part는 추출된 call과 같은 판정 경로를 탑니다.
    fn events_for_chunk(
        &self,
        chunk: &GenerateResponse,
        extractor: &mut FunctionCallExtractor,
    ) -> Vec<PendingEvent> {
        let mut out = Vec::new();

        for part in chunk.parts() {
            match part {
                Part::Text { text, thought } if thought.unwrap_or(false) => {
                    out.push(PendingEvent::Ready(StreamEvent::thought_from_text(text)));
                }
                Part::Text { text, .. } => {
                    let ExtractResult { calls, text } = extractor.feed(text);
                    if !text.is_empty() {
                        out.push(PendingEvent::Ready(StreamEvent::content(text)));
                    }
                    out.extend(calls.into_iter().map(PendingEvent::Call));
                }
                Part::FunctionCall { function_call } => {
                    let args = if function_call.args.is_null() {
                        serde_json::Value::Object(Default::default())
                    } else {
                        function_call.args.clone()
                    };
                    out.push(PendingEvent::Call(ParsedCall {
                        name: function_call.name.clone(),
                        args,
                        id: function_call.id.clone(),
                    }));
                }
                // 모델 출력에는 등장하지 않는 part
                Part::FunctionResponse { .. } => {}
            }
        }

        out
    }

    /// call 하나를 정책 판정을 거쳐 이벤트로 바꿉니다. `None`은 취소입니다.
    async fn resolve_call(
        &self,
        call: ParsedCall,
        cancel: &CancellationToken,
    ) -> Option<StreamEvent> {
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

        let request_event = StreamEvent::ToolCallRequest {
            id: id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        };

        match self.policy.check(&call) {
            PolicyDecision::Allow => Some(request_event),
            PolicyDecision::Deny => {
                tracing::debug!(tool = %call.name, "tool call denied by policy");
                Some(StreamEvent::ToolCallResponse {
                    id,
                    error: Some(format!("tool call {:?} denied by policy", call.name)),
                })
            }
            PolicyDecision::AskUser => match &self.confirmation_handler {
                // 확인 수단이 없으면 요청을 그대로 내보내고 확인은 소비자 몫
                None => Some(request_event),
                Some(handler) => {
                    let approval = handler(call.clone());
                    let approved = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        approved = approval => approved,
                    };
                    if approved {
                        Some(request_event)
                    } else {
                        tracing::debug!(tool = %call.name, "tool call rejected by user");
                        Some(StreamEvent::ToolCallResponse {
                            id,
                            error: Some(format!("tool call {:?} rejected by user", call.name)),
                        })
                    }
                }
            },
        }
    }
}

enum PendingEvent {
    Ready(StreamEvent),
    Call(ParsedCall),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRule;
    use async_trait::async_trait;
    use ember_backend::{ChunkStream, EmbedRequest, EmbedResponse, TokenCount};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// attempt마다 스크립트된 결과를 돌려주는 generator
    struct ScriptedGenerator {
        attempts: Vec<Vec<std::result::Result<GenerateResponse, BackendError>>>,
        cursor: AtomicUsize,
        seen_models: parking_lot::Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(attempts: Vec<Vec<std::result::Result<GenerateResponse, BackendError>>>) -> Self {
            Self {
                attempts,
                cursor: AtomicUsize::new(0),
                seen_models: parking_lot::Mutex::new(Vec::new()),
            }
        }

        fn seen_models(&self) -> Vec<String> {
            self.seen_models.lock().clone()
        }
    }

    #[async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            request: GenerateRequest,
            _prompt_id: &str,
        ) -> std::result::Result<GenerateResponse, BackendError> {
            self.seen_models
                .lock()
                .push(request.model.unwrap_or_default());
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let attempt = self
                .attempts
                .get(idx)
                .cloned()
                .unwrap_or_default();
            attempt
                .into_iter()
                .next()
                .unwrap_or_else(|| Ok(GenerateResponse::default()))
        }

        fn generate_stream(&self, request: GenerateRequest, _prompt_id: &str) -> ChunkStream {
            self.seen_models
                .lock()
                .push(request.model.unwrap_or_default());
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
            let chunks = self.attempts.get(idx).cloned().unwrap_or_default();
            Box::pin(futures::stream::iter(chunks))
        }

        async fn count_tokens(
            &self,
            _request: &GenerateRequest,
        ) -> std::result::Result<TokenCount, BackendError> {
            Ok(TokenCount::estimate(0))
        }

        async fn embed(
            &self,
            _request: EmbedRequest,
        ) -> std::result::Result<EmbedResponse, BackendError> {
            Err(BackendError::NotSupported("test".to_string()))
        }
    }

    fn text_chunk(text: &str) -> GenerateResponse {
        GenerateResponse::from_text(text)
    }

    fn allow_all_policy() -> PolicyEngine {
        let mut policy = PolicyEngine::new(PolicyDecision::AskUser, false);
        policy.add_rule(PolicyRule::wildcard(PolicyDecision::Allow, 0));
        policy
    }

    fn turn_with(
        generator: Arc<ScriptedGenerator>,
        session: Arc<Session>,
        policy: PolicyEngine,
    ) -> Turn {
        Turn::new(generator, session, AuthKind::OauthPersonal, policy)
            .with_retry_config(RetryConfig::no_retry())
    }

    async fn collect(turn: &Turn) -> Vec<StreamEvent> {
        turn.run(
            GenerateRequest::from_prompt("hi"),
            "p1",
            CancellationToken::new(),
        )
        .collect()
        .await
    }

    #[tokio::test]
    async fn test_text_chunks_become_content_events() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            Ok(text_chunk("hello ")),
            Ok(text_chunk("world")),
        ]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session, allow_all_policy());

        let events = collect(&turn).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::content("hello "),
                StreamEvent::content("world"),
            ]
        );
        assert_eq!(turn.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn test_inline_call_becomes_tool_request() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            Ok(text_chunk("I'll check the file. ")),
            Ok(text_chunk(
                r#"{"functionCall": {"name": "read_file", "args": {"path": "a.txt"}}}"#,
            )),
        ]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session, allow_all_policy());

        let events = collect(&turn).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::content("I'll check the file. "));
        match &events[1] {
            StreamEvent::ToolCallRequest { name, args, .. } => {
                assert_eq!(name, "read_file");
                assert_eq!(args, &json!({"path": "a.txt"}));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denied_call_becomes_tool_response_error() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Ok(text_chunk(
            r#"{"functionCall": {"name": "shell", "args": {"command": "rm -rf /"}}}"#,
        ))]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let mut policy = PolicyEngine::new(PolicyDecision::Allow, false);
        policy.add_rule(PolicyRule::for_tool("shell", PolicyDecision::Deny, 10));
        let turn = turn_with(generator, session, policy);

        let events = collect(&turn).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCallResponse { error: Some(_), .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_thought_part_becomes_thought_event() {
        let chunk = GenerateResponse {
            candidates: vec![ember_backend::Candidate {
                content: Some(ember_backend::Content {
                    role: "model".to_string(),
                    parts: vec![Part::thought("**Planning** read the file first")],
                }),
                finish_reason: None,
            }],
            usage: None,
        };
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Ok(chunk)]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session, allow_all_policy());

        let events = collect(&turn).await;
        assert_eq!(
            events,
            vec![StreamEvent::Thought {
                subject: "Planning".to_string(),
                description: "read the file first".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_quota_fallback_retries_with_fallback_model() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            vec![Err(BackendError::QuotaExceeded("daily limit".to_string()))],
            vec![Ok(text_chunk("recovered"))],
        ]));
        let telemetry_count = Arc::new(AtomicUsize::new(0));
        let hook_count = telemetry_count.clone();
        let session = Arc::new(Session::new("gemini-2.5-pro").with_telemetry_hook(Arc::new(
            move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            },
        )));

        let turn = turn_with(generator.clone(), session.clone(), allow_all_policy())
            .with_fallback_handler(Arc::new(|_context| {
                Box::pin(async { FallbackIntent::Retry })
            }));

        let events = collect(&turn).await;
        assert_eq!(events, vec![StreamEvent::content("recovered")]);
        assert!(session.is_in_fallback_mode());
        assert_eq!(telemetry_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            generator.seen_models(),
            vec!["gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()]
        );
    }

    #[tokio::test]
    async fn test_second_quota_error_on_fallback_model_fails_turn() {
        // 폴백 모델까지 쿼터가 막히면 더 내려갈 곳이 없음
        let generator = Arc::new(ScriptedGenerator::new(vec![
            vec![Err(BackendError::QuotaExceeded("pro limit".to_string()))],
            vec![Err(BackendError::QuotaExceeded("flash limit".to_string()))],
        ]));
        let telemetry_count = Arc::new(AtomicUsize::new(0));
        let hook_count = telemetry_count.clone();
        let session = Arc::new(Session::new("gemini-2.5-pro").with_telemetry_hook(Arc::new(
            move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            },
        )));

        let turn = turn_with(generator, session.clone(), allow_all_policy())
            .with_fallback_handler(Arc::new(|_context| {
                Box::pin(async { FallbackIntent::Retry })
            }));

        let events = collect(&turn).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
        // 래치는 멱등이므로 활성화 이벤트는 정확히 1회
        assert_eq!(telemetry_count.load(Ordering::SeqCst), 1);
        assert_eq!(turn.state(), TurnState::Failed);
    }

    #[tokio::test]
    async fn test_fallback_stop_latches_and_fails() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Err(
            BackendError::QuotaExceeded("limit".to_string()),
        )]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session.clone(), allow_all_policy())
            .with_fallback_handler(Arc::new(|_context| {
                Box::pin(async { FallbackIntent::Stop })
            }));

        let events = collect(&turn).await;
        assert!(matches!(events[0], StreamEvent::Error { .. }));
        assert!(session.is_in_fallback_mode());
    }

    #[tokio::test]
    async fn test_fallback_auth_does_not_latch() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Err(
            BackendError::QuotaExceeded("limit".to_string()),
        )]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session.clone(), allow_all_policy())
            .with_fallback_handler(Arc::new(|_context| {
                Box::pin(async { FallbackIntent::Auth })
            }));

        let events = collect(&turn).await;
        match &events[0] {
            StreamEvent::Error { message, .. } => {
                assert!(message.contains("reauthentication"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!session.is_in_fallback_mode());
    }

    #[tokio::test]
    async fn test_api_key_quota_error_skips_fallback() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Err(
            BackendError::QuotaExceeded("limit".to_string()),
        )]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let consulted = Arc::new(AtomicUsize::new(0));
        let consulted_count = consulted.clone();

        let turn = Turn::new(
            generator,
            session.clone(),
            AuthKind::ApiKey,
            allow_all_policy(),
        )
        .with_retry_config(RetryConfig::no_retry())
        .with_fallback_handler(Arc::new(move |_context| {
            consulted_count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { FallbackIntent::Retry })
        }));

        let events = collect(&turn).await;
        assert!(matches!(events[0], StreamEvent::Error { .. }));
        assert_eq!(consulted.load(Ordering::SeqCst), 0);
        assert!(!session.is_in_fallback_mode());
    }

    #[tokio::test]
    async fn test_cancellation_stops_event_stream() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            Ok(text_chunk("first")),
            Ok(text_chunk("second")),
        ]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session, allow_all_policy());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let events: Vec<StreamEvent> = turn
            .run(GenerateRequest::from_prompt("hi"), "p1", cancel)
            .collect()
            .await;
        assert!(events.is_empty());
        assert_eq!(turn.state(), TurnState::Failed);
    }

    #[tokio::test]
    async fn test_rejected_confirmation_becomes_tool_response() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![Ok(text_chunk(
            r#"{"functionCall": {"name": "write_file", "args": {"path": "a"}}}"#,
        ))]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let policy = PolicyEngine::new(PolicyDecision::AskUser, false);
        let turn = turn_with(generator, session, policy)
            .with_confirmation_handler(Arc::new(|_call| Box::pin(async { false })));

        let events = collect(&turn).await;
        match &events[0] {
            StreamEvent::ToolCallResponse { error: Some(msg), .. } => {
                assert!(msg.contains("rejected"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_inline_call_dropped_at_stream_end() {
        let generator = Arc::new(ScriptedGenerator::new(vec![vec![
            Ok(text_chunk("done. ")),
            Ok(text_chunk(r#"{"functionCall": {"name": "f", "args": {"#)),
        ]]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator, session, allow_all_policy());

        let events = collect(&turn).await;
        assert_eq!(events, vec![StreamEvent::content("done. ")]);
        assert_eq!(turn.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn test_generate_consults_fallback_on_quota() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            vec![Err(BackendError::QuotaExceeded("limit".to_string()))],
            vec![Ok(text_chunk("ok"))],
        ]));
        let session = Arc::new(Session::new("gemini-2.5-pro"));
        let turn = turn_with(generator.clone(), session.clone(), allow_all_policy())
            .with_fallback_handler(Arc::new(|_context| {
                Box::pin(async { FallbackIntent::Retry })
            }));

        let response = turn
            .generate(GenerateRequest::from_prompt("hi"), "p1")
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
        assert!(session.is_in_fallback_mode());
        assert_eq!(
            generator.seen_models(),
            vec!["gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()]
        );
    }
}
