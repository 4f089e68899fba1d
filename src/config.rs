use crate::logging::LogLevel;
use crate::orchestrator::RetryPolicy;
use crate::orchestrator::backoff::BackoffPolicy;
use crate::quota::QuotaLimits;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PRIMARY_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_FALLBACK_MODEL: &str = "gemini-2.5-flash";

const DEFAULT_RETRY_MAX_ATTEMPTS: usize = 4;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_RETRY_JITTER: f64 = 0.1;

/// 内置的免费档配额（rpm, tpm, rpd），环境变量可逐项覆盖，设为 0 表示不限制。
const BUILTIN_LIMITS: &[(&str, u32, u64, u32)] = &[
    ("gemini-2.5-pro", 5, 250_000, 100),
    ("gemini-2.5-flash", 10, 250_000, 250),
];

#[derive(Debug, Clone)]
pub struct Config {
    pub primary_model: String,
    pub fallback_model: String,

    pub model_limits: HashMap<String, QuotaLimits>,

    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter: f64,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "MODEL_NAME")]
    model_name: Option<String>,
    #[serde(alias = "ALT_MODEL_NAME")]
    alt_model_name: Option<String>,

    #[serde(alias = "RETRY_MAX_ATTEMPTS")]
    retry_max_attempts: Option<usize>,
    #[serde(alias = "RETRY_BASE_DELAY_MS")]
    retry_base_delay_ms: Option<u64>,
    #[serde(alias = "RETRY_MAX_DELAY_MS")]
    retry_max_delay_ms: Option<u64>,
    #[serde(alias = "RETRY_JITTER")]
    retry_jitter: Option<f64>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

/// `<PREFIX>_RPM` / `<PREFIX>_TPM` / `<PREFIX>_RPD`（前缀已被 Env::prefixed 去掉）。
#[derive(Debug, Default, Deserialize)]
struct RawLimits {
    #[serde(alias = "RPM")]
    rpm: Option<u32>,
    #[serde(alias = "TPM")]
    tpm: Option<u64>,
    #[serde(alias = "RPD")]
    rpd: Option<u32>,
}

impl Config {
    /// 加载 `.env` 后读取进程环境。
    pub fn load() -> Self {
        load_dotenv();
        Self::from_env()
    }

    /// 只读取进程环境，不触碰 `.env`。
    pub fn from_env() -> Self {
        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_else(|e| {
                tracing::warn!("环境变量解析失败，使用默认配置: {e}");
                RawEnv::default()
            });

        let primary_model = non_empty(raw.model_name)
            .unwrap_or_else(|| DEFAULT_PRIMARY_MODEL.to_string());
        let fallback_model = non_empty(raw.alt_model_name)
            .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL.to_string());

        let mut model_limits = HashMap::new();
        for model in [&primary_model, &fallback_model] {
            if model_limits.contains_key(model.as_str()) {
                continue;
            }
            let limits = load_model_limits(model);
            for warning in limits.warnings(model) {
                tracing::warn!(model = %model, "配额配置可疑: {warning}");
            }
            model_limits.insert(model.clone(), limits);
        }

        Self {
            primary_model,
            fallback_model,
            model_limits,
            retry_max_attempts: raw
                .retry_max_attempts
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            retry_base_delay_ms: raw
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay_ms: raw.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
            retry_jitter: raw
                .retry_jitter
                .filter(|j| j.is_finite())
                .map(|j| j.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_RETRY_JITTER),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }

    /// 备用模型；与主模型相同或为空时视为没有。
    pub fn fallback(&self) -> Option<&str> {
        let fallback = self.fallback_model.trim();
        if fallback.is_empty() || fallback == self.primary_model {
            None
        } else {
            Some(fallback)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let max = Duration::from_millis(self.retry_max_delay_ms);
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.retry_base_delay_ms).min(max),
                max,
                jitter: self.retry_jitter,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let model_limits = [DEFAULT_PRIMARY_MODEL, DEFAULT_FALLBACK_MODEL]
            .into_iter()
            .map(|m| (m.to_string(), builtin_limits(m)))
            .collect();
        Self {
            primary_model: DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            model_limits,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            retry_jitter: DEFAULT_RETRY_JITTER,
            debug: "off".to_string(),
        }
    }
}

/// 模型名转环境变量前缀：大写，`-` `.` `/` 替换为 `_`。
pub fn env_prefix(model: &str) -> String {
    model
        .trim()
        .chars()
        .map(|c| match c {
            '-' | '.' | '/' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn builtin_limits(model: &str) -> QuotaLimits {
    BUILTIN_LIMITS
        .iter()
        .find(|(name, ..)| *name == model)
        .map(|&(_, rpm, tpm, rpd)| QuotaLimits::new(rpm, tpm, rpd))
        .unwrap_or_default()
}

fn load_model_limits(model: &str) -> QuotaLimits {
    let defaults = builtin_limits(model);
    let prefix = format!("{}_", env_prefix(model));
    let raw = Figment::from(Env::prefixed(&prefix))
        .extract::<RawLimits>()
        .unwrap_or_else(|e| {
            tracing::warn!(model, "配额环境变量解析失败，使用内置默认值: {e}");
            RawLimits::default()
        });

    QuotaLimits::new(
        raw.rpm.unwrap_or(defaults.rpm().unwrap_or(0)),
        raw.tpm.unwrap_or(defaults.tpm().unwrap_or(0)),
        raw.rpd.unwrap_or(defaults.rpd().unwrap_or(0)),
    )
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(content) = std::fs::read_to_string(&dotenv_path) else {
        return;
    };

    for (key, value) in content.lines().filter_map(parse_dotenv_line) {
        // 已存在的进程环境变量优先于 .env。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024 中 set_var 为 unsafe：仅在启动阶段、尚无其他线程读写环境时调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        dir = dir.parent()?;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')));
    let value = if quoted {
        &raw[1..raw.len() - 1]
    } else {
        strip_inline_comment(raw)
    };
    Some((key.to_string(), value.to_string()))
}

/// 去掉 ` # ...` 形式的行尾注释；`#` 前必须是空白。
fn strip_inline_comment(value: &str) -> &str {
    value
        .char_indices()
        .find(|&(i, c)| c == '#' && (i == 0 || value[..i].ends_with([' ', '\t'])))
        .map_or(value, |(i, _)| value[..i].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn env_prefix_replaces_separators() {
        assert_eq!(env_prefix("gemini-2.5-pro"), "GEMINI_2_5_PRO");
        assert_eq!(env_prefix("models/gemini-2.5-flash"), "MODELS_GEMINI_2_5_FLASH");
    }

    #[test]
    fn defaults_without_environment() {
        Jail::expect_with(|_jail| {
            let cfg = Config::from_env();
            assert_eq!(cfg.primary_model, DEFAULT_PRIMARY_MODEL);
            assert_eq!(cfg.fallback(), Some(DEFAULT_FALLBACK_MODEL));
            assert_eq!(cfg.retry_max_attempts, 4);
            assert_eq!(cfg.log_level(), LogLevel::Off);
            assert_eq!(
                cfg.model_limits[DEFAULT_PRIMARY_MODEL],
                QuotaLimits::new(5, 250_000, 100)
            );
            assert_eq!(
                cfg.model_limits[DEFAULT_FALLBACK_MODEL],
                QuotaLimits::new(10, 250_000, 250)
            );

            let policy = cfg.retry_policy();
            assert_eq!(policy.max_attempts, 4);
            assert_eq!(policy.backoff, BackoffPolicy::default());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("MODEL_NAME", "gemini-2.5-flash");
            jail.set_env("ALT_MODEL_NAME", "custom/model-x");
            jail.set_env("GEMINI_2_5_FLASH_RPM", "3");
            jail.set_env("GEMINI_2_5_FLASH_TPM", "0");
            jail.set_env("CUSTOM_MODEL_X_RPD", "42");
            jail.set_env("RETRY_MAX_ATTEMPTS", "6");
            jail.set_env("RETRY_BASE_DELAY_MS", "250");
            jail.set_env("RETRY_JITTER", "0.3");
            jail.set_env("DEBUG", "medium");

            let cfg = Config::from_env();
            assert_eq!(cfg.primary_model, "gemini-2.5-flash");
            assert_eq!(cfg.fallback(), Some("custom/model-x"));
            assert_eq!(
                cfg.model_limits["gemini-2.5-flash"],
                QuotaLimits::new(3, 0, 250)
            );
            assert_eq!(cfg.model_limits["custom/model-x"], QuotaLimits::new(0, 0, 42));
            assert_eq!(cfg.log_level(), LogLevel::Medium);

            let policy = cfg.retry_policy();
            assert_eq!(policy.max_attempts, 6);
            assert_eq!(policy.backoff.base, Duration::from_millis(250));
            assert!((policy.backoff.jitter - 0.3).abs() < 1e-9);
            Ok(())
        });
    }

    #[test]
    fn same_fallback_is_ignored() {
        Jail::expect_with(|jail| {
            jail.set_env("MODEL_NAME", "gemini-2.5-pro");
            jail.set_env("ALT_MODEL_NAME", "gemini-2.5-pro");
            let cfg = Config::from_env();
            assert_eq!(cfg.fallback(), None);
            assert_eq!(cfg.model_limits.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn parse_dotenv_lines() {
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=x"), None);
        assert_eq!(
            parse_dotenv_line("export MODEL_NAME = gemini-2.5-pro"),
            Some(("MODEL_NAME".to_string(), "gemini-2.5-pro".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("DEBUG=high # verbose"),
            Some(("DEBUG".to_string(), "high".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("KEY='a # b'"),
            Some(("KEY".to_string(), "a # b".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("URL=http://x/#frag"),
            Some(("URL".to_string(), "http://x/#frag".to_string()))
        );
    }
}
