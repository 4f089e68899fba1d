//! 请求编排：在主/备用模型之间选择、预留配额、调用后端、分类失败并决定重试。
//!
//! 单次逻辑调用的状态流转：
//! 选模型 → 预留 → 调用 → 成功 | 配额错误（换模型/等冷却后重试，或失败）
//! | 临时错误（退避后重试，或失败）| 致命错误（立即失败）。

pub mod backoff;
pub mod select;

use crate::config::Config;
use crate::error::RelayError;
use crate::logging::{self, LogLevel};
use crate::provider::{FailureKind, ProviderError, TokenUsage, classify};
use crate::quota::QuotaTracker;
use backoff::BackoffPolicy;
use select::Choice;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// 一次逻辑调用的描述。
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub primary: String,
    pub fallback: Option<String>,
    pub estimated_tokens: u64,
    /// 仅用于日志（例如 "initial" / "follow-up"）。
    pub label: String,
}

impl CallRequest {
    pub fn new(primary: impl Into<String>, estimated_tokens: u64) -> Self {
        Self {
            primary: primary.into(),
            fallback: None,
            estimated_tokens,
            label: "request".to_string(),
        }
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// 有效的备用模型：为空或与主模型相同时视为没有。
    fn effective_fallback(&self) -> Option<&str> {
        self.fallback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty() && *f != self.primary)
    }
}

/// 成功结果：后端响应、实际使用的模型以及总尝试次数。
#[derive(Debug, Clone)]
pub struct Execution<T> {
    pub response: T,
    pub model: String,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    tracker: Arc<QuotaTracker>,
    policy: RetryPolicy,
    log_level: LogLevel,
}

impl Orchestrator {
    pub fn new(tracker: Arc<QuotaTracker>, policy: RetryPolicy) -> Self {
        Self {
            tracker,
            policy,
            log_level: LogLevel::Off,
        }
    }

    pub fn from_config(cfg: &Config, tracker: Arc<QuotaTracker>) -> Self {
        Self::new(tracker, cfg.retry_policy()).with_log_level(cfg.log_level())
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 执行一次逻辑调用。
    ///
    /// `operation` 接收本次尝试选中的模型名，返回后端响应或后端错误。
    /// 每次尝试的预留都会被提交（成功）或释放（失败），不会遗留在账本里。
    pub async fn execute<T, F, Fut>(
        &self,
        req: &CallRequest,
        mut operation: F,
    ) -> Result<Execution<T>, RelayError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        T: TokenUsage,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let label = req.label.as_str();
        let mut last_quota: Option<RelayError> = None;
        let mut last_failure: Option<ProviderError> = None;
        let mut prev_delay = Duration::ZERO;

        for attempt in 0..max_attempts {
            let model = self.select_model(req, attempt == 0).await;

            self.tracker.reserve(&model, req.estimated_tokens).await;

            if attempt > 0 && self.log_level.retry_enabled() {
                tracing::info!(
                    label,
                    model = %model,
                    "重试第 {}/{} 次",
                    attempt + 1,
                    max_attempts
                );
            }

            let err = match operation(model.clone()).await {
                Ok(response) => {
                    self.tracker.commit(&model, response.total_tokens()).await;
                    if attempt > 0 && self.log_level.retry_enabled() {
                        tracing::info!(label, model = %model, "第 {} 次尝试成功", attempt + 1);
                    }
                    return Ok(Execution {
                        response,
                        model,
                        attempts: attempt + 1,
                    });
                }
                Err(err) => err,
            };

            // 先释放预留再分类，分类出错也不会泄漏配额。
            self.tracker.release(&model).await;
            let has_next = attempt + 1 < max_attempts;

            match classify(&err) {
                FailureKind::QuotaExceeded(info) => {
                    if let Some(delay) = info.retry_after {
                        self.tracker.register_backoff(&model, delay).await;
                    }
                    tracing::warn!(
                        label,
                        model = %model,
                        retry_after_ms = info.retry_after.map(logging::format_duration_ms),
                        "后端配额耗尽: {}",
                        info.message
                    );
                    last_quota = Some(RelayError::QuotaExceeded {
                        model,
                        message: info.message,
                        retry_after: info.retry_after,
                    });
                }
                FailureKind::Transient => {
                    if has_next {
                        // 封顶后抖动可能让延迟变短，这里保证同一次调用内不递减。
                        let delay = self.policy.backoff.delay(attempt as u32).max(prev_delay);
                        prev_delay = delay;
                        if self.log_level.retry_enabled() {
                            tracing::warn!(
                                label,
                                model = %model,
                                error = %err,
                                delay_ms = logging::format_duration_ms(delay),
                                "调用失败（{}/{}），退避后重试",
                                attempt + 1,
                                max_attempts
                            );
                        }
                        tokio::time::sleep(delay).await;
                    } else {
                        tracing::warn!(label, model = %model, error = %err, "重试次数用尽");
                    }
                    last_failure = Some(err);
                }
                FailureKind::Fatal => {
                    if self.log_level.retry_enabled() {
                        tracing::warn!(label, model = %model, error = %err, "不可重试的错误");
                    }
                    return Err(RelayError::Fatal { model, source: err });
                }
            }
        }

        // 配额错误带有可操作的重试提示，优先返回。
        if let Some(err) = last_quota {
            return Err(err);
        }
        Err(RelayError::Unavailable {
            attempts: max_attempts,
            source: last_failure.unwrap_or_else(|| ProviderError::transport("未知错误")),
        })
    }

    async fn select_model(&self, req: &CallRequest, first_attempt: bool) -> String {
        let Some(fallback) = req.effective_fallback() else {
            return req.primary.clone();
        };

        let wait_primary = self
            .tracker
            .wait_time(&req.primary, req.estimated_tokens)
            .await;
        let wait_fallback = self.tracker.wait_time(fallback, req.estimated_tokens).await;

        match select::choose(first_attempt, wait_primary, wait_fallback) {
            Choice::Primary => req.primary.clone(),
            Choice::Fallback => {
                if self.log_level.quota_enabled() && !wait_primary.is_zero() {
                    tracing::info!(
                        label = req.label.as_str(),
                        model = fallback,
                        primary_wait_ms = logging::format_duration_ms(wait_primary),
                        "主模型受限，切换到备用模型"
                    );
                }
                fallback.to_string()
            }
        }
    }
}
