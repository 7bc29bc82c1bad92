// comm_client/src/ws_client/backoff.rs

//! 重连退避计算。
//!
//! 第 n 次重连（从 1 开始）的等待时间为 `min(base * 2^(n-1), cap)`，再加上不超过其 10% 的均匀随机抖动。
//! 计数在一次断线期间单调递增，只在连接成功或手动重连时清零。

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ReconnectController {
    attempts: u32,
    max_attempts: u32,
    base_ms: u64,
    cap_ms: u64,
}

impl ReconnectController {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.max_attempts,
            base_ms: config.base_interval_ms,
            cap_ms: config.cap_ms,
        }
    }

    /// 采用新的重连参数。已登记的重连次数保留，新上限从下一次重连起生效。
    pub fn reconfigure(&mut self, config: &ReconnectConfig) {
        self.max_attempts = config.max_attempts;
        self.base_ms = config.base_interval_ms;
        self.cap_ms = config.cap_ms;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// 不含抖动的等待时间。
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = attempt
            .checked_sub(1)
            .and_then(|exp| 1u64.checked_shl(exp))
            .unwrap_or(u64::MAX);
        let raw = if attempt == 0 { 0 } else { self.base_ms.saturating_mul(factor) };
        Duration::from_millis(raw.min(self.cap_ms))
    }

    fn with_jitter(delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=ms / 10);
        Duration::from_millis(ms + jitter)
    }

    /// 登记下一次重连并返回 `(序号, 等待时间)`。次数已耗尽时返回 `None`。
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, Self::with_jitter(self.base_delay(self.attempts))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_attempts: u32) -> ReconnectController {
        ReconnectController::new(&ReconnectConfig {
            max_attempts,
            base_interval_ms: 1000,
            cap_ms: 30_000,
            ..ReconnectConfig::default()
        })
    }

    #[test]
    fn test_delay_grows_exponentially_within_jitter_bounds() {
        let mut backoff = controller(10);
        for n in 1..=10u32 {
            let (attempt, delay) = backoff.next_attempt().expect("次数未耗尽时应返回等待时间");
            assert_eq!(attempt, n);
            let expected = (1000u64 << (n - 1)).min(30_000);
            let ms = delay.as_millis() as u64;
            assert!(
                ms >= expected && ms <= expected + expected / 10,
                "第 {} 次重连的等待时间 {}ms 超出 [{}, {}]",
                n,
                ms,
                expected,
                expected + expected / 10
            );
        }
        assert!(backoff.next_attempt().is_none(), "达到上限后不应再给出重连");
    }

    #[test]
    fn test_base_delay_saturates_at_cap() {
        let backoff = controller(100);
        assert_eq!(backoff.base_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(5), Duration::from_millis(16_000));
        assert_eq!(backoff.base_delay(6), Duration::from_millis(30_000));
        assert_eq!(backoff.base_delay(80), Duration::from_millis(30_000), "大序号不应溢出");
    }

    #[test]
    fn test_reset_restarts_counting() {
        let mut backoff = controller(2);
        backoff.next_attempt();
        backoff.next_attempt();
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_attempt().map(|(n, _)| n), Some(1), "清零后应从第 1 次重新计数");
    }

    #[test]
    fn test_reconfigure_keeps_count_and_applies_new_limits() {
        let mut backoff = controller(2);
        backoff.next_attempt();
        backoff.next_attempt();
        assert!(backoff.is_exhausted());

        backoff.reconfigure(&ReconnectConfig {
            max_attempts: 4,
            base_interval_ms: 200,
            cap_ms: 500,
            ..ReconnectConfig::default()
        });
        assert_eq!(backoff.attempts(), 2, "调整参数不应清零计数");
        let (attempt, delay) = backoff.next_attempt().expect("提高上限后应允许继续重连");
        assert_eq!(attempt, 3);
        assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_millis(550));
    }
}
