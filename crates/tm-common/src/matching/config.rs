use std::time::Duration;

use super::ranking::DEFAULT_TOP_K;

/// リクエストで指定できる top_k の上限
pub const MAX_TOP_K: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 一時的な失敗に対する再試行回数（0 = 再試行しない）
    pub max_retries: u32,
    /// バックオフの基準値（attempt ごとに倍）
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    /// attempt 回目（1 始まり）の待ち時間
    pub fn backoff(&self, attempt: u32) -> Duration {
        let capped = attempt.saturating_sub(1).min(5);
        self.base_backoff.saturating_mul(1 << capped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// 返す件数の既定値
    pub top_k: usize,
    /// 同時に投げる埋め込み呼び出しの上限
    pub max_concurrency: usize,
    /// 1 回の呼び出しのタイムアウト
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// 1 リクエストあたりの候補数上限
    pub max_candidates: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            max_concurrency: 4,
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            max_candidates: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("MATCH_TOP_K must not exceed {}", MAX_TOP_K)]
    TopKTooLarge,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
        }

        Self {
            top_k: parse("MATCH_TOP_K").unwrap_or(defaults.top_k),
            max_concurrency: parse("MATCH_MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            call_timeout: parse("MATCH_CALL_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            retry: RetryPolicy {
                max_retries: parse("MATCH_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
                base_backoff: parse("MATCH_RETRY_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_backoff),
            },
            max_candidates: parse("MATCH_MAX_TUTORS").unwrap_or(defaults.max_candidates),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineConfigError> {
        if self.top_k == 0 {
            return Err(PipelineConfigError::NotPositive("MATCH_TOP_K"));
        }
        if self.top_k > MAX_TOP_K {
            return Err(PipelineConfigError::TopKTooLarge);
        }
        if self.max_concurrency == 0 {
            return Err(PipelineConfigError::NotPositive("MATCH_MAX_CONCURRENCY"));
        }
        if self.call_timeout.is_zero() {
            return Err(PipelineConfigError::NotPositive("MATCH_CALL_TIMEOUT_MS"));
        }
        if self.max_candidates == 0 {
            return Err(PipelineConfigError::NotPositive("MATCH_MAX_TUTORS"));
        }
        Ok(())
    }

    /// リクエストの limit を 1..=MAX_TOP_K に丸める。未指定なら既定値。
    pub fn resolve_top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.top_k).clamp(1, MAX_TOP_K)
    }
}
