//! Retry logic with exponential backoff
//!
//! 할당량 에러는 재시도 전에 호출자에게 한번 물어볼 수 있습니다
//! (`with_retry_consult`). 폴백 프로토콜이 이 지점에 끼어듭니다.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Initial delay between retries (milliseconds)
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,

    /// Whether to add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            // Add 20% jitter (0.8 to 1.2)
            let jitter_factor = 0.8 + rand_jitter() * 0.4;
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0)
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClassification {
    /// Should retry (transient error)
    Retry,

    /// Should not retry (permanent error)
    NoRetry,

    /// Rate limited - use provided delay if available
    RateLimited { retry_after_ms: Option<u64> },
}

/// Trait for errors that can be classified for retry
pub trait RetryableError {
    fn classify(&self) -> RetryClassification;

    /// 할당량/용량 계열 에러인지 (폴백 상담 대상)
    fn is_quota(&self) -> bool {
        false
    }
}

/// 할당량 에러 상담 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDirective {
    /// 재시도 카운터를 리셋하고 즉시 다음 시도로 (폴백 모델 적용 후)
    Retry,

    /// 일반 재시도 분류에 맡김
    Continue,

    /// 재시도 없이 에러를 그대로 반환
    Stop,
}

/// Execute an async operation with retry logic
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_consult(config, operation_name, |_| async { QuotaDirective::Continue }, operation)
        .await
}

/// Execute with retry, consulting `on_quota` before handling quota errors
///
/// `on_quota`는 할당량 에러마다 한 번 호출됩니다. `Retry`를 돌려주면
/// 시도 카운터가 리셋되고 지연 없이 다음 시도가 시작됩니다 (호출측이
/// 이미 모델 전환 등 상태를 바꿨다는 가정).
pub async fn with_retry_consult<T, E, F, Fut, Q, QFut>(
    config: &RetryConfig,
    operation_name: &str,
    mut on_quota: Q,
    mut operation: F,
) -> Result<T, E>
where
    E: RetryableError + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Q: FnMut(&E) -> QFut,
    QFut: Future<Output = QuotaDirective>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if e.is_quota() {
                    match on_quota(&e).await {
                        QuotaDirective::Retry => {
                            debug!(
                                "{}: quota error, retrying after fallback consultation: {}",
                                operation_name, e
                            );
                            attempt = 0;
                            continue;
                        }
                        QuotaDirective::Stop => return Err(e),
                        QuotaDirective::Continue => {}
                    }
                }

                let classification = e.classify();

                match classification {
                    RetryClassification::NoRetry => {
                        debug!(
                            "{}: non-retryable error on attempt {}: {}",
                            operation_name,
                            attempt + 1,
                            e
                        );
                        return Err(e);
                    }
                    RetryClassification::Retry | RetryClassification::RateLimited { .. } => {
                        if attempt >= config.max_retries {
                            warn!(
                                "{}: max retries ({}) exceeded: {}",
                                operation_name, config.max_retries, e
                            );
                            return Err(e);
                        }

                        let delay = match classification {
                            RetryClassification::RateLimited {
                                retry_after_ms: Some(ms),
                            } => Duration::from_millis(ms),
                            _ => config.delay_for_attempt(attempt),
                        };

                        warn!(
                            "{}: attempt {} failed, retrying in {:?}: {}",
                            operation_name,
                            attempt + 1,
                            delay,
                            e
                        );

                        sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}
