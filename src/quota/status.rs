use crate::quota::limits::QuotaLimits;
use crate::quota::tracker::QuotaTracker;
use crate::quota::window::ModelQuotaState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// 剩余分钟请求数低于该比例时提示"接近上限"。
const APPROACHING_LIMIT_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Available,
    ApproachingLimit,
    RateLimited,
}

/// 面向运维/前端的单模型配额视图。剩余量为 None 表示该维度不限制。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub requests_remaining: Option<u32>,
    pub tokens_remaining: Option<u64>,
    pub daily_requests_remaining: Option<u32>,
    pub estimated_wait_seconds: u64,
    pub quota_status: QuotaStatus,
    pub limits: QuotaLimits,
}

impl ModelStatus {
    fn from_state(limits: QuotaLimits, state: Option<&ModelQuotaState>, wait: Duration) -> Self {
        let (minute, day, tokens) = match state {
            Some(s) => (
                s.minute_requests.len(),
                s.day_requests.len(),
                s.token_sum() + s.pending_sum(),
            ),
            None => (0, 0, 0),
        };

        let requests_remaining = limits.rpm().map(|rpm| remaining_u32(rpm, minute));
        let tokens_remaining = limits.tpm().map(|tpm| tpm.saturating_sub(tokens));
        let daily_requests_remaining = limits.rpd().map(|rpd| remaining_u32(rpd, day));

        let quota_status = if !wait.is_zero() {
            QuotaStatus::RateLimited
        } else if let (Some(left), Some(rpm)) = (requests_remaining, limits.rpm())
            && (left as f64) / (rpm as f64) < APPROACHING_LIMIT_RATIO
        {
            QuotaStatus::ApproachingLimit
        } else {
            QuotaStatus::Available
        };

        Self {
            requests_remaining,
            tokens_remaining,
            daily_requests_remaining,
            estimated_wait_seconds: ceil_secs(wait),
            quota_status,
            limits,
        }
    }
}

fn remaining_u32(limit: u32, used: usize) -> u32 {
    let used = u32::try_from(used).unwrap_or(u32::MAX);
    limit.saturating_sub(used)
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

impl QuotaTracker {
    /// 所有已配置模型的当前配额视图（按模型名排序）。
    pub async fn status(&self) -> BTreeMap<String, ModelStatus> {
        let mut out = BTreeMap::new();
        for model in self.configured_models() {
            out.insert(model.to_string(), self.model_status(model).await);
        }
        out
    }

    pub async fn model_status(&self, model: &str) -> ModelStatus {
        let limits = self.limits(model);
        self.with_state(model, |state, now| {
            let wait = state
                .as_deref()
                .map(|s| s.wait_time(&limits, 0, now))
                .unwrap_or(Duration::ZERO);
            ModelStatus::from_state(limits, state.as_deref(), wait)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(HashMap::from([
            ("pro".to_string(), QuotaLimits::new(5, 1_000, 100)),
            (
                "flash".to_string(),
                QuotaLimits {
                    requests_per_minute: Some(10),
                    tokens_per_minute: None,
                    requests_per_day: None,
                },
            ),
        ]))
    }

    #[tokio::test(start_paused = true)]
    async fn unused_models_report_full_allowance() {
        let t = tracker();
        let status = t.status().await;
        assert_eq!(status.keys().collect::<Vec<_>>(), vec!["flash", "pro"]);

        let pro = &status["pro"];
        assert_eq!(pro.requests_remaining, Some(5));
        assert_eq!(pro.tokens_remaining, Some(1_000));
        assert_eq!(pro.daily_requests_remaining, Some(100));
        assert_eq!(pro.estimated_wait_seconds, 0);
        assert_eq!(pro.quota_status, QuotaStatus::Available);

        let flash = &status["flash"];
        assert_eq!(flash.tokens_remaining, None);
        assert_eq!(flash.daily_requests_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn status_tracks_usage_and_limits() {
        let t = tracker();
        for _ in 0..4 {
            t.reserve("pro", 100).await;
        }
        t.commit("pro", 150).await;

        let pro = t.model_status("pro").await;
        assert_eq!(pro.requests_remaining, Some(1));
        assert_eq!(pro.tokens_remaining, Some(1_000 - 150 - 300));
        assert_eq!(pro.daily_requests_remaining, Some(96));
        assert_eq!(pro.quota_status, QuotaStatus::Available);

        t.reserve("pro", 0).await;
        let pro = t.model_status("pro").await;
        assert_eq!(pro.requests_remaining, Some(0));
        assert_eq!(pro.quota_status, QuotaStatus::RateLimited);
        assert_eq!(pro.estimated_wait_seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn approaching_limit_below_twenty_percent() {
        let t = tracker();
        for _ in 0..9 {
            t.reserve("flash", 0).await;
        }
        let flash = t.model_status("flash").await;
        assert_eq!(flash.requests_remaining, Some(1));
        assert_eq!(flash.quota_status, QuotaStatus::ApproachingLimit);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_reports_rate_limited() {
        let t = tracker();
        t.register_backoff("flash", Duration::from_millis(2_500)).await;
        let flash = t.model_status("flash").await;
        assert_eq!(flash.quota_status, QuotaStatus::RateLimited);
        assert_eq!(flash.estimated_wait_seconds, 3);
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = ModelStatus::from_state(QuotaLimits::new(5, 0, 0), None, Duration::ZERO);
        let json = sonic_rs::to_string(&s).unwrap();
        assert!(json.contains(r#""quota_status":"available""#));
        assert!(json.contains(r#""rpm":5"#));
        assert!(json.contains(r#""tokens_remaining":null"#));
    }
}
