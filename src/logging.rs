use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// 调度日志等级（由 DEBUG 环境变量控制）：
/// - off：只输出 warn 及以上（配置告警、提交超时等）
/// - low：额外输出重试与失败
/// - medium：额外输出模型切换与配额等待
/// - high：额外输出每一次预留/提交/释放
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "retry" => Self::Low,
            "medium" | "quota" => Self::Medium,
            "high" | "all" | "trace" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn retry_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn quota_enabled(self) -> bool {
        self >= Self::Medium
    }

    /// 是否输出每一次预留/提交等账本操作（high）。
    pub fn ledger_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// 安装全局 tracing subscriber。
///
/// 依赖库日志默认压到 warn，本 crate 自身至少为 info，
/// 避免环境里预设的 RUST_LOG=warn 把重试日志过滤掉。
pub fn init_tracing(cfg: &Config) {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = build_filter(env.trim(), cfg.log_level());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn build_filter(env: &str, level: LogLevel) -> EnvFilter {
    let own = if level == LogLevel::Off {
        "quota_relay=warn"
    } else {
        "quota_relay=info"
    };
    if env.is_empty() {
        EnvFilter::new(format!("warn,{own}"))
    } else if env.contains("quota_relay") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},{own}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_aliases_and_defaults_to_off() {
        assert_eq!(LogLevel::parse("low"), LogLevel::Low);
        assert_eq!(LogLevel::parse("  MEDIUM "), LogLevel::Medium);
        assert_eq!(LogLevel::parse("all"), LogLevel::High);
        assert_eq!(LogLevel::parse(""), LogLevel::Off);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Off);
    }

    #[test]
    fn levels_are_cumulative() {
        assert!(!LogLevel::Off.retry_enabled());
        assert!(LogLevel::Low.retry_enabled());
        assert!(!LogLevel::Low.quota_enabled());
        assert!(LogLevel::High.quota_enabled());
        assert!(LogLevel::High.ledger_enabled());
        assert!(!LogLevel::Medium.ledger_enabled());
    }

    #[test]
    fn format_duration_ms_truncates() {
        assert_eq!(format_duration_ms(Duration::from_micros(1_999)), 1);
        assert_eq!(format_duration_ms(Duration::from_secs(2)), 2_000);
    }
}
