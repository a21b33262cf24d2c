use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 退避决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDecision {
    /// 延迟后重试
    Retry { delay: Duration },
    /// 已用尽重试次数，转为永久失败
    GiveUp,
}

/// 指数退避策略
///
/// 第 n 次失败（n 从 0 开始）后的延迟为 `base_delay × 2^n`；
/// 当 `n == max_attempts` 时不再重试。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    /// 延迟上限，`None` 表示不封顶
    #[serde(default)]
    pub max_delay: Option<Duration>,
    /// 随机抖动范围（0.0-1.0），默认不抖动
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_attempts: 3,
            max_delay: None,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// 不含抖动的第 n 次重试延迟
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// 根据已发生的重试次数决定下一步
    pub fn decide(&self, attempt_count: u32) -> BackoffDecision {
        if attempt_count >= self.max_attempts {
            return BackoffDecision::GiveUp;
        }

        let delay = self.delay_for(attempt_count);
        if self.jitter_factor <= 0.0 {
            return BackoffDecision::Retry { delay };
        }

        // 抖动避免大量任务同时重试，结果不低于 base_delay
        let secs = delay.as_secs_f64();
        let jitter = secs * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let jittered = (secs + jitter).max(self.base_delay.as_secs_f64());
        BackoffDecision::Retry {
            delay: Duration::from_secs_f64(jittered),
        }
    }

    /// 有延迟提示时取两者较大值，提示不会缩短退避
    pub fn decide_with_hint(&self, attempt_count: u32, hint: Option<Duration>) -> BackoffDecision {
        match (self.decide(attempt_count), hint) {
            (BackoffDecision::Retry { delay }, Some(hint)) => BackoffDecision::Retry {
                delay: delay.max(hint),
            },
            (decision, _) => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_then_give_up() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), 3);
        assert_eq!(
            policy.decide(0),
            BackoffDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(
            policy.decide(1),
            BackoffDecision::Retry {
                delay: Duration::from_secs(120)
            }
        );
        assert_eq!(
            policy.decide(2),
            BackoffDecision::Retry {
                delay: Duration::from_secs(240)
            }
        );
        assert_eq!(policy.decide(3), BackoffDecision::GiveUp);
        assert_eq!(policy.decide(7), BackoffDecision::GiveUp);
    }

    #[test]
    fn test_delay_formula_for_all_attempts() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), 6);
        for n in 0..6 {
            assert_eq!(policy.delay_for(n), Duration::from_secs(5 * 2u64.pow(n)));
        }
    }

    #[test]
    fn test_max_delay_caps() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(60), 10).with_max_delay(Duration::from_secs(300));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), 3).with_jitter(0.1);
        for _ in 0..50 {
            match policy.decide(1) {
                BackoffDecision::Retry { delay } => {
                    assert!(delay >= Duration::from_secs(108));
                    assert!(delay <= Duration::from_secs(132));
                }
                BackoffDecision::GiveUp => panic!("should retry"),
            }
        }
    }

    #[test]
    fn test_hint_never_shortens_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(60), 3);
        assert_eq!(
            policy.decide_with_hint(0, Some(Duration::from_secs(10))),
            BackoffDecision::Retry {
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(
            policy.decide_with_hint(0, Some(Duration::from_secs(600))),
            BackoffDecision::Retry {
                delay: Duration::from_secs(600)
            }
        );
        assert_eq!(
            policy.decide_with_hint(3, Some(Duration::from_secs(1))),
            BackoffDecision::GiveUp
        );
    }
}
