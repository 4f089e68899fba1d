pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod quota;
pub mod util;

pub use config::Config;
pub use error::RelayError;
pub use orchestrator::{CallRequest, Execution, Orchestrator, RetryPolicy};
pub use provider::{ProviderError, TokenUsage};
pub use quota::{QuotaLimits, QuotaTracker};
