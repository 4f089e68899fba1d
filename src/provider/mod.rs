//! 后端（推理服务）调用的边界类型。
//!
//! 真正的 HTTP 客户端不在本 crate 内：调用方把一次请求包装成
//! `operation(model) -> Result<T, ProviderError>`，编排器只关心结果如何分类。

pub mod classify;

use thiserror::Error;

pub use classify::{FailureKind, QuotaErrorInfo, classify};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// 后端返回了非 2xx 响应；`body` 为原始响应体（可能为空）。
    #[error("后端错误 {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: String,
    },

    /// 网络/SDK 等其他失败，只能通过错误文本判断类型。
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: String::new(),
        }
    }

    pub fn http_with_body(status: u16, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: body.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(anyhow::anyhow!(message.into()))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(_) => None,
        }
    }
}

/// 成功响应实际消耗的 token 数，用于提交配额。
pub trait TokenUsage {
    fn total_tokens(&self) -> u64;
}
