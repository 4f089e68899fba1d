use std::time::Duration;

/// 本次尝试选中的模型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Primary,
    Fallback,
}

/// 根据两边的等待时间选择模型。
///
/// - 首次尝试：默认主模型；只有主模型需要等待而备用模型立即可用时才切换。
/// - 失败后的重试：主模型立即可用且备用模型需要等待时才回到主模型，
///   其余情况（同样可用 / 都要等待）一律使用备用模型，把压力从刚出错的模型上移开。
pub fn choose(first_attempt: bool, wait_primary: Duration, wait_fallback: Duration) -> Choice {
    let primary_ready = wait_primary.is_zero();
    let fallback_ready = wait_fallback.is_zero();

    if first_attempt {
        if !primary_ready && fallback_ready {
            Choice::Fallback
        } else {
            Choice::Primary
        }
    } else if primary_ready && !fallback_ready {
        Choice::Primary
    } else {
        Choice::Fallback
    }
}
