//! 指数退避 + 随机抖动。

use std::cell::Cell;
use std::time::Duration;

/// 退避下限，避免抖动把延迟压到接近 0。
const MIN_DELAY: Duration = Duration::from_millis(100);

thread_local! {
    /// 轻量 PRNG：每线程一个 state，避免锁。
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    let u = uuid::Uuid::new_v4().as_u128();
    let s = (u as u64) ^ ((u >> 64) as u64);
    // xorshift 的零种子会退化。
    if s == 0 { 0x9E37_79B9_7F4A_7C15 } else { s }
}

fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        // xorshift64*
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

/// [-1.0, 1.0) 上的均匀分布。
fn unit_symmetric() -> f64 {
    let frac = (next_u64() >> 11) as f64 / (1u64 << 53) as f64;
    frac * 2.0 - 1.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// 抖动比例，例如 0.1 表示 ±10%。
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// 第 `attempt` 次（从 0 开始）失败后的名义延迟：base·2^attempt，封顶 max。
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(62) as i32);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// 名义延迟加上 ±jitter 比例的随机抖动，结果落在 [MIN_DELAY, max]。
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = nominal + nominal * jitter * unit_symmetric();
        let secs = secs.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(secs).max(MIN_DELAY.min(self.max))
    }
}
