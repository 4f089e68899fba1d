use serde::Serialize;

/// 单个模型的配额上限。任一维度为 None 或 0 表示该维度不限制。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    #[serde(rename = "rpm")]
    pub requests_per_minute: Option<u32>,
    #[serde(rename = "tpm")]
    pub tokens_per_minute: Option<u64>,
    #[serde(rename = "rpd")]
    pub requests_per_day: Option<u32>,
}

impl QuotaLimits {
    pub fn new(rpm: u32, tpm: u64, rpd: u32) -> Self {
        Self {
            requests_per_minute: Some(rpm),
            tokens_per_minute: Some(tpm),
            requests_per_day: Some(rpd),
        }
        .normalized()
    }

    /// 把 0 统一成 None，后续判断只需要看 Option。
    pub fn normalized(self) -> Self {
        Self {
            requests_per_minute: self.requests_per_minute.filter(|v| *v > 0),
            tokens_per_minute: self.tokens_per_minute.filter(|v| *v > 0),
            requests_per_day: self.requests_per_day.filter(|v| *v > 0),
        }
    }

    pub fn rpm(&self) -> Option<u32> {
        self.requests_per_minute.filter(|v| *v > 0)
    }

    pub fn tpm(&self) -> Option<u64> {
        self.tokens_per_minute.filter(|v| *v > 0)
    }

    pub fn rpd(&self) -> Option<u32> {
        self.requests_per_day.filter(|v| *v > 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rpm().is_none() && self.tpm().is_none() && self.rpd().is_none()
    }

    /// 检查明显不合理的配置，返回可读的告警（不会拒绝配置）。
    pub fn warnings(&self, model: &str) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(rpm) = self.rpm()
            && rpm > 1000
        {
            out.push(format!("{model}: RPM 异常偏高（{rpm}）"));
        }

        if let Some(tpm) = self.tpm() {
            if tpm < 100 {
                out.push(format!("{model}: TPM 过低（{tpm}）"));
            } else if tpm > 10_000_000 {
                out.push(format!("{model}: TPM 异常偏高（{tpm}）"));
            }
        }

        if let Some(rpd) = self.rpd() {
            if rpd < 10 {
                out.push(format!("{model}: RPD 过低（{rpd}）"));
            } else if rpd > 100_000 {
                out.push(format!("{model}: RPD 异常偏高（{rpd}）"));
            }
        }

        // 一天 1440 分钟：按分钟上限跑满一天会超过日上限。
        if let (Some(rpm), Some(rpd)) = (self.rpm(), self.rpd())
            && u64::from(rpm) * 1440 > u64::from(rpd)
        {
            out.push(format!("{model}: RPM × 1440 超过 RPD（可能冲突）"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_means_unlimited() {
        let limits = QuotaLimits::new(0, 0, 0);
        assert!(limits.is_unlimited());
        assert_eq!(limits.rpm(), None);

        let limits = QuotaLimits {
            requests_per_minute: Some(0),
            tokens_per_minute: Some(1_000),
            requests_per_day: None,
        };
        assert!(!limits.is_unlimited());
        assert_eq!(limits.rpm(), None);
        assert_eq!(limits.tpm(), Some(1_000));
    }

    #[test]
    fn warnings_flag_out_of_range_values() {
        let limits = QuotaLimits::new(2_000, 50, 5);
        let w = limits.warnings("m");
        assert!(w.iter().any(|s| s.contains("RPM 异常偏高")));
        assert!(w.iter().any(|s| s.contains("TPM 过低")));
        assert!(w.iter().any(|s| s.contains("RPD 过低")));
        assert!(w.iter().any(|s| s.contains("RPM × 1440")));
    }

    #[test]
    fn sane_limits_only_report_daily_conflict() {
        // gemini-2.5-pro 默认值：5 × 1440 > 100，仅提示冲突。
        let w = QuotaLimits::new(5, 250_000, 100).warnings("gemini-2.5-pro");
        assert_eq!(w.len(), 1);
        assert!(w[0].contains("RPM × 1440"));

        assert!(QuotaLimits::default().warnings("x").is_empty());
    }
}
