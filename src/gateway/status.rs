//! 配额状态查询接口，供宿主应用挂载到自己的 Router 上。

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::quota::{ModelStatus, QuotaTracker};

pub const STATUS_PATH: &str = "/rate-limit-status";

#[derive(Debug)]
pub struct StatusState {
    pub tracker: Arc<QuotaTracker>,
    pub primary_model: String,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatus {
    pub models: BTreeMap<String, ModelStatus>,
    pub primary_model: String,
    pub timestamp: DateTime<Utc>,
}

pub fn routes(tracker: Arc<QuotaTracker>, primary_model: impl Into<String>) -> Router {
    let state = Arc::new(StatusState {
        tracker,
        primary_model: primary_model.into(),
    });
    Router::new()
        .route(STATUS_PATH, get(handle_status))
        .with_state(state)
}

/// GET /rate-limit-status - 各模型剩余配额与预计等待时间
pub async fn handle_status(State(state): State<Arc<StatusState>>) -> Json<RateLimitStatus> {
    Json(RateLimitStatus {
        models: state.tracker.status().await,
        primary_model: state.primary_model.clone(),
        timestamp: Utc::now(),
    })
}
