use std::time::Duration;

/// 指数退避，封顶 `max`
#[derive(Clone, Debug)]
pub enum Backoff {
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Backoff::Exponential { base, max }
    }

    /// 第 `attempt` 次失败后的等待时间，`attempt` 从 1 开始
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                std::cmp::min(base.saturating_mul(factor), *max)
            }
        }
    }
}
