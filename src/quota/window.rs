//! 单个模型的滑动窗口账本。
//!
//! 这里只有纯计算：调用方负责加锁以及提供当前时间，便于在测试里直接构造时间点。

use crate::quota::limits::QuotaLimits;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const DAY_WINDOW: Duration = Duration::from_secs(86_400);

#[derive(Debug, Default)]
pub struct ModelQuotaState {
    pub(crate) minute_requests: VecDeque<Instant>,
    pub(crate) day_requests: VecDeque<Instant>,
    pub(crate) token_events: VecDeque<(Instant, u64)>,
    pub(crate) token_sum: u64,
    pub(crate) pending: VecDeque<u64>,
    pub(crate) pending_sum: u64,
    pub(crate) cooldown_until: Option<Instant>,
}

/// 距离 `since + window` 还剩多久；已过期返回 0。
fn remaining(since: Instant, window: Duration, now: Instant) -> Duration {
    (since + window).saturating_duration_since(now)
}

impl ModelQuotaState {
    pub fn prune(&mut self, now: Instant) {
        while self
            .minute_requests
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE_WINDOW)
        {
            self.minute_requests.pop_front();
        }
        while self
            .day_requests
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= DAY_WINDOW)
        {
            self.day_requests.pop_front();
        }
        while let Some(&(t, count)) = self.token_events.front() {
            if now.saturating_duration_since(t) < MINUTE_WINDOW {
                break;
            }
            self.token_events.pop_front();
            self.token_sum = self.token_sum.saturating_sub(count);
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }

    /// 在当前时刻预留 `reserve` 个 token 需要等待多久（调用前应先 prune）。
    pub fn wait_time(&self, limits: &QuotaLimits, reserve: u64, now: Instant) -> Duration {
        let mut wait = self.request_wait(limits, now);

        if let Some(tpm) = limits.tpm() {
            let effective = self
                .token_sum
                .saturating_add(self.pending_sum)
                .saturating_add(reserve);
            if effective > tpm {
                wait = wait.max(self.token_wait(now));
            }
        }

        wait
    }

    /// 不看 token 维度的等待：冷却、RPM、RPD。
    pub fn request_wait(&self, limits: &QuotaLimits, now: Instant) -> Duration {
        let mut wait = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        if let Some(rpm) = limits.rpm()
            && self.minute_requests.len() >= rpm as usize
            && let Some(oldest) = self.minute_requests.front()
        {
            wait = wait.max(remaining(*oldest, MINUTE_WINDOW, now));
        }

        if let Some(rpd) = limits.rpd()
            && self.day_requests.len() >= rpd as usize
            && let Some(oldest) = self.day_requests.front()
        {
            wait = wait.max(remaining(*oldest, DAY_WINDOW, now));
        }

        wait
    }

    /// token 窗口溢出时的等待：最早的已提交事件滑出窗口；没有已提交事件时等一整个窗口。
    fn token_wait(&self, now: Instant) -> Duration {
        match self.token_events.front() {
            Some((t, _)) => remaining(*t, MINUTE_WINDOW, now),
            None => MINUTE_WINDOW,
        }
    }

    /// 单次预留本身超过 TPM 且窗口里既无已提交用量也无挂起预留。
    ///
    /// 这种预留等多久都不会变得合适，调用方等满一个窗口后可以绕过 token 检查。
    pub fn is_oversize_on_idle_window(&self, limits: &QuotaLimits, reserve: u64) -> bool {
        limits.tpm().is_some_and(|tpm| reserve > tpm)
            && self.token_events.is_empty()
            && self.pending_sum == 0
    }

    /// 记录一次请求准入：两个请求窗口各记一笔，并挂起预留的 token。
    ///
    /// 预留为 0 也要入队，保证每次准入都恰好对应一次 commit/release。
    pub fn admit(&mut self, reserve: u64, now: Instant) {
        self.minute_requests.push_back(now);
        self.day_requests.push_back(now);
        self.pending.push_back(reserve);
        self.pending_sum = self.pending_sum.saturating_add(reserve);
    }

    pub fn pop_pending(&mut self) -> Option<u64> {
        let reserved = self.pending.pop_front()?;
        self.pending_sum = self.pending_sum.saturating_sub(reserved);
        Some(reserved)
    }

    pub fn restore_pending(&mut self, reserved: u64) {
        self.pending.push_front(reserved);
        self.pending_sum = self.pending_sum.saturating_add(reserved);
    }

    /// 实际用量加入已提交窗口后需要等待多久（调用前应先 prune 并取出对应预留）。
    pub fn commit_wait(&self, limits: &QuotaLimits, tokens: u64, now: Instant) -> Duration {
        let fits = limits
            .tpm()
            .is_none_or(|tpm| self.token_sum.saturating_add(tokens) <= tpm);
        if fits {
            return Duration::ZERO;
        }
        match self.token_events.front() {
            Some((t, _)) => remaining(*t, MINUTE_WINDOW, now),
            None => Duration::ZERO,
        }
    }

    pub fn record_tokens(&mut self, tokens: u64, now: Instant) {
        if tokens == 0 {
            return;
        }
        self.token_events.push_back((now, tokens));
        self.token_sum = self.token_sum.saturating_add(tokens);
    }

    pub fn extend_cooldown(&mut self, until: Instant) {
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    pub fn token_sum(&self) -> u64 {
        self.token_sum
    }

    pub fn pending_sum(&self) -> u64 {
        self.pending_sum
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: u32, tpm: u64, rpd: u32) -> QuotaLimits {
        QuotaLimits::new(rpm, tpm, rpd)
    }

    #[test]
    fn prune_subtracts_exact_expired_counts() {
        let t0 = Instant::now();
        let mut s = ModelQuotaState::default();
        s.record_tokens(300, t0);
        s.record_tokens(200, t0 + Duration::from_secs(30));
        assert_eq!(s.token_sum(), 500);

        s.prune(t0 + Duration::from_secs(60));
        assert_eq!(s.token_sum(), 200);
        assert_eq!(s.token_events.len(), 1);

        s.prune(t0 + Duration::from_secs(90));
        assert_eq!(s.token_sum(), 0);
        assert!(s.token_events.is_empty());
    }

    #[test]
    fn rpm_wait_is_time_until_oldest_leaves_window() {
        let t0 = Instant::now();
        let l = limits(2, 0, 0);
        let mut s = ModelQuotaState::default();
        s.admit(0, t0);
        s.admit(0, t0 + Duration::from_secs(10));

        let now = t0 + Duration::from_secs(15);
        s.prune(now);
        assert_eq!(s.wait_time(&l, 0, now), Duration::from_secs(45));

        let now = t0 + Duration::from_secs(60);
        s.prune(now);
        assert_eq!(s.wait_time(&l, 0, now), Duration::ZERO);
    }

    #[test]
    fn rpd_wait_uses_day_window() {
        let t0 = Instant::now();
        let l = limits(0, 0, 1);
        let mut s = ModelQuotaState::default();
        s.admit(0, t0);

        let now = t0 + Duration::from_secs(3_600);
        s.prune(now);
        assert_eq!(
            s.wait_time(&l, 0, now),
            Duration::from_secs(86_400 - 3_600)
        );
    }

    #[test]
    fn token_wait_counts_pending_reservations() {
        let t0 = Instant::now();
        let l = limits(0, 1_000, 0);
        let mut s = ModelQuotaState::default();
        s.record_tokens(600, t0);
        s.admit(300, t0 + Duration::from_secs(5));

        let now = t0 + Duration::from_secs(20);
        s.prune(now);
        assert_eq!(s.wait_time(&l, 100, now), Duration::ZERO);
        assert_eq!(s.wait_time(&l, 101, now), Duration::from_secs(40));
    }

    #[test]
    fn token_overflow_without_events_waits_full_window() {
        let t0 = Instant::now();
        let l = limits(0, 100, 0);
        let mut s = ModelQuotaState::default();

        // 空窗口上的超大预留也要等一整个窗口。
        assert_eq!(s.wait_time(&l, 500, t0), MINUTE_WINDOW);
        assert!(s.is_oversize_on_idle_window(&l, 500));
        assert!(!s.is_oversize_on_idle_window(&l, 100));
        assert_eq!(s.request_wait(&l, t0), Duration::ZERO);

        // 只有挂起预留：同样等一整个窗口，且不再算作空窗口。
        s.admit(80, t0);
        assert_eq!(s.wait_time(&l, 50, t0), MINUTE_WINDOW);
        assert!(!s.is_oversize_on_idle_window(&l, 500));
    }

    #[test]
    fn huge_estimates_saturate_instead_of_overflowing() {
        let t0 = Instant::now();
        let l = limits(0, 1_000, 0);
        let mut s = ModelQuotaState::default();
        s.record_tokens(10, t0);
        s.admit(u64::MAX - 5, t0);
        s.admit(u64::MAX, t0);
        assert_eq!(s.pending_sum(), u64::MAX);

        assert_eq!(s.wait_time(&l, u64::MAX, t0), MINUTE_WINDOW);
        assert_eq!(s.commit_wait(&l, u64::MAX, t0), MINUTE_WINDOW);

        s.pop_pending();
        s.pop_pending();
        assert_eq!(s.pending_sum(), 0);
    }

    #[test]
    fn cooldown_dominates_and_expires() {
        let t0 = Instant::now();
        let l = QuotaLimits::default();
        let mut s = ModelQuotaState::default();
        s.extend_cooldown(t0 + Duration::from_secs(5));
        // 更早的冷却不会缩短已有冷却。
        s.extend_cooldown(t0 + Duration::from_secs(2));

        assert_eq!(s.wait_time(&l, 0, t0), Duration::from_secs(5));

        let now = t0 + Duration::from_secs(5);
        s.prune(now);
        assert!(s.cooldown_until.is_none());
        assert_eq!(s.wait_time(&l, 0, now), Duration::ZERO);
    }

    #[test]
    fn pending_pop_and_restore_keep_sum_in_sync() {
        let t0 = Instant::now();
        let mut s = ModelQuotaState::default();
        s.admit(10, t0);
        s.admit(20, t0);
        assert_eq!(s.pending_sum(), 30);

        assert_eq!(s.pop_pending(), Some(10));
        assert_eq!(s.pending_sum(), 20);
        s.restore_pending(10);
        assert_eq!(s.pending_sum(), 30);
        assert_eq!(s.pending.front(), Some(&10));

        assert_eq!(s.pop_pending(), Some(10));
        assert_eq!(s.pop_pending(), Some(20));
        assert_eq!(s.pop_pending(), None);
        assert_eq!(s.pending_sum(), 0);
    }

    #[test]
    fn commit_wait_ignores_pending() {
        let t0 = Instant::now();
        let l = limits(0, 1_000, 0);
        let mut s = ModelQuotaState::default();
        s.record_tokens(900, t0);
        s.admit(500, t0);

        let now = t0 + Duration::from_secs(1);
        assert_eq!(s.commit_wait(&l, 100, now), Duration::ZERO);
        assert_eq!(s.commit_wait(&l, 101, now), Duration::from_secs(59));
    }
}
