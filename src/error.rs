use crate::provider::ProviderError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// 后端明确拒绝（配额耗尽），带上后端给出的重试提示交给调用方决定。
    #[error("模型 {model} 配额已耗尽: {message}")]
    QuotaExceeded {
        model: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 临时不可用，重试次数用尽。
    #[error("后端服务暂时不可用（已尝试 {attempts} 次），最后一次错误: {source}")]
    Unavailable {
        attempts: usize,
        #[source]
        source: ProviderError,
    },

    /// 不可重试的错误，第一次出现即返回。
    #[error("模型 {model} 调用失败: {source}")]
    Fatal {
        model: String,
        #[source]
        source: ProviderError,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<f64>,
}

impl RelayError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Unavailable { .. } => "unavailable",
            Self::Fatal { .. } => "backend",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let model = match &self {
            Self::QuotaExceeded { model, .. } | Self::Fatal { model, .. } => Some(model.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: self.kind(),
                model,
                retry_after_seconds: self.retry_after().map(|d| d.as_secs_f64()),
            },
        };

        (status, Json(body)).into_response()
    }
}
