use crate::config::Config;
use crate::logging::{self, LogLevel};
use crate::quota::limits::QuotaLimits;
use crate::quota::window::{MINUTE_WINDOW, ModelQuotaState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// 按模型维护配额账本，负责准入（reserve）与结算（commit/release）。
///
/// 每个模型一把独立的锁：不同模型之间互不阻塞；锁只覆盖账本操作，
/// 从不覆盖真正的后端调用。
///
/// 等待方式是"睡眠后重新检查"，同一模型的多个等待者之间没有先来先服务的保证。
#[derive(Debug)]
pub struct QuotaTracker {
    limits: HashMap<String, QuotaLimits>,
    states: RwLock<HashMap<String, Arc<Mutex<ModelQuotaState>>>>,
    log_level: LogLevel,
}

/// 某个模型当前账本的只读快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub minute_requests: usize,
    pub day_requests: usize,
    pub committed_tokens: u64,
    pub pending_tokens: u64,
    pub pending_reservations: usize,
}

impl QuotaTracker {
    pub fn new(limits: HashMap<String, QuotaLimits>) -> Self {
        let limits = limits
            .into_iter()
            .map(|(model, l)| (model.trim().to_string(), l.normalized()))
            .filter(|(model, _)| !model.is_empty())
            .collect();
        Self {
            limits,
            states: RwLock::new(HashMap::new()),
            log_level: LogLevel::Off,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.model_limits.clone()).with_log_level(cfg.log_level())
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn limits(&self, model: &str) -> QuotaLimits {
        self.limits.get(model).copied().unwrap_or_default()
    }

    /// 已配置上限的模型（按名称排序）。
    pub fn configured_models(&self) -> Vec<&str> {
        let mut models: Vec<&str> = self.limits.keys().map(String::as_str).collect();
        models.sort_unstable();
        models
    }

    async fn existing_state(&self, model: &str) -> Option<Arc<Mutex<ModelQuotaState>>> {
        self.states.read().await.get(model).cloned()
    }

    async fn state(&self, model: &str) -> Arc<Mutex<ModelQuotaState>> {
        if let Some(state) = self.existing_state(model).await {
            return state;
        }
        let mut states = self.states.write().await;
        states.entry(model.to_string()).or_default().clone()
    }

    /// 现在预留 `estimated_tokens` 需要等待多久；返回 0 表示 reserve 不会挂起。
    pub async fn wait_time(&self, model: &str, estimated_tokens: u64) -> Duration {
        let limits = self.limits(model);
        let Some(state) = self.existing_state(model).await else {
            // 尚未使用过的模型按空账本计算，超大预留同样需要等待。
            return ModelQuotaState::default().wait_time(
                &limits,
                estimated_tokens,
                Instant::now(),
            );
        };
        let mut s = state.lock().await;
        let now = Instant::now();
        s.prune(now);
        s.wait_time(&limits, estimated_tokens, now)
    }

    /// 等到配额允许后记录一次请求，并挂起 `estimated_tokens` 的预留。
    ///
    /// 每一次成功的 reserve 之后必须且只能调用一次 commit 或 release。
    pub async fn reserve(&self, model: &str, estimated_tokens: u64) {
        let limits = self.limits(model);
        let state = self.state(model).await;
        let start = Instant::now();

        loop {
            let wait = {
                let mut s = state.lock().await;
                let now = Instant::now();
                s.prune(now);
                let mut wait = s.wait_time(&limits, estimated_tokens, now);
                // 超过 TPM 的单次预留在空窗口上等满一个窗口后放行，否则会永远等下去。
                if !wait.is_zero()
                    && now - start >= MINUTE_WINDOW
                    && s.is_oversize_on_idle_window(&limits, estimated_tokens)
                {
                    wait = s.request_wait(&limits, now);
                    if wait.is_zero() {
                        tracing::warn!(
                            model,
                            tokens = estimated_tokens,
                            "预留超过 TPM 上限，等待一个窗口后放行"
                        );
                    }
                }
                if wait.is_zero() {
                    if !limits.is_unlimited() {
                        s.admit(estimated_tokens, now);
                    }
                    if self.log_level.ledger_enabled() {
                        tracing::info!(
                            model,
                            tokens = estimated_tokens,
                            pending = s.pending_sum(),
                            waited_ms = logging::format_duration_ms(now - start),
                            "配额预留成功"
                        );
                    }
                    return;
                }
                wait
            };

            if self.log_level.quota_enabled() {
                tracing::info!(
                    model,
                    tokens = estimated_tokens,
                    wait_ms = logging::format_duration_ms(wait),
                    "配额不足，等待窗口滑动"
                );
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// 结算一次调用：取出最早的预留，用实际用量替换它。
    ///
    /// 实际用量放不进 token 窗口时会等待（期间预留放回，避免低估占用），
    /// 最多等待一个窗口；超时后照常记账并输出告警。
    pub async fn commit(&self, model: &str, actual_tokens: u64) {
        let limits = self.limits(model);
        if limits.is_unlimited() {
            return;
        }
        let state = self.state(model).await;
        let deadline = Instant::now() + MINUTE_WINDOW;

        loop {
            let sleep_for = {
                let mut s = state.lock().await;
                let now = Instant::now();
                s.prune(now);
                let reserved = s.pop_pending();
                let wait = s.commit_wait(&limits, actual_tokens, now);

                if wait.is_zero() || now >= deadline {
                    if !wait.is_zero() {
                        tracing::warn!(
                            model,
                            tokens = actual_tokens,
                            committed = s.token_sum(),
                            "实际用量持续超出 TPM，等待一个窗口后强制记账"
                        );
                    }
                    s.record_tokens(actual_tokens, now);
                    if self.log_level.ledger_enabled() {
                        tracing::info!(
                            model,
                            tokens = actual_tokens,
                            reserved = reserved.unwrap_or(0),
                            committed = s.token_sum(),
                            "配额提交"
                        );
                    }
                    return;
                }

                if let Some(r) = reserved {
                    s.restore_pending(r);
                }
                wait.min(deadline.saturating_duration_since(now))
            };

            if self.log_level.quota_enabled() {
                tracing::info!(
                    model,
                    tokens = actual_tokens,
                    wait_ms = logging::format_duration_ms(sleep_for),
                    "实际用量超出 TPM，等待后提交"
                );
            }
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// 放弃一次预留（调用失败时），不影响已提交用量。
    pub async fn release(&self, model: &str) {
        if self.limits(model).is_unlimited() {
            return;
        }
        let state = self.state(model).await;
        let mut s = state.lock().await;
        let released = s.pop_pending();
        if self.log_level.ledger_enabled() {
            tracing::info!(
                model,
                tokens = released.unwrap_or(0),
                pending = s.pending_sum(),
                "配额预留释放"
            );
        }
    }

    /// 后端明确要求的冷却：在 `delay` 之内该模型的 wait_time 不会小于剩余冷却时间。
    pub async fn register_backoff(&self, model: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let state = self.state(model).await;
        let mut s = state.lock().await;
        s.extend_cooldown(Instant::now() + delay);
        if self.log_level.quota_enabled() {
            tracing::info!(
                model,
                delay_ms = logging::format_duration_ms(delay),
                "登记后端冷却"
            );
        }
    }

    pub async fn usage(&self, model: &str) -> UsageSnapshot {
        let Some(state) = self.existing_state(model).await else {
            return UsageSnapshot::default();
        };
        let mut s = state.lock().await;
        s.prune(Instant::now());
        UsageSnapshot {
            minute_requests: s.minute_requests.len(),
            day_requests: s.day_requests.len(),
            committed_tokens: s.token_sum(),
            pending_tokens: s.pending_sum(),
            pending_reservations: s.pending_len(),
        }
    }

    pub(crate) async fn with_state<R>(
        &self,
        model: &str,
        f: impl FnOnce(Option<&mut ModelQuotaState>, Instant) -> R,
    ) -> R {
        let now = Instant::now();
        match self.existing_state(model).await {
            Some(state) => {
                let mut s = state.lock().await;
                s.prune(now);
                f(Some(&mut *s), now)
            }
            None => f(None, now),
        }
    }
}
