//! 按模型的配额账本：滑动窗口计数、预留/结算以及状态视图。

pub mod limits;
pub mod status;
pub mod tracker;
pub mod window;

pub use limits::QuotaLimits;
pub use status::{ModelStatus, QuotaStatus};
pub use tracker::{QuotaTracker, UsageSnapshot};
pub use window::{DAY_WINDOW, MINUTE_WINDOW};
