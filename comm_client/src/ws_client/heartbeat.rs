// comm_client/src/ws_client/heartbeat.rs

//! 心跳监视器。
//!
//! 只记录两个截止时间：下一次探测时刻，以及静默告警时刻（最后一次应答后超过两个周期）。
//! 到期的处理由连接管理器完成；监视器本身不发送任何数据，也不触发重连。
//! 每次静默只告警一次，收到应答后解除，下一次静默可以再次告警。

use std::time::Duration;

use log::warn;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Running {
    next_probe: Instant,
    last_ack: Instant,
    warned: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    running: Option<Running>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self { interval, running: None }
    }

    /// 更换探测周期。正在计时时从 `now` 重新开始，静默告警按新周期计算。
    pub fn set_interval(&mut self, interval: Duration, now: Instant) {
        self.interval = interval;
        if self.running.is_some() {
            self.start(now);
        }
    }

    /// 开始计时。`now` 视为最后一次应答时刻。
    pub fn start(&mut self, now: Instant) {
        self.running = Some(Running {
            next_probe: now + self.interval,
            last_ack: now,
            warned: false,
        });
    }

    pub fn stop(&mut self) {
        self.running = None;
    }

    pub fn next_probe(&self) -> Option<Instant> {
        self.running.map(|r| r.next_probe)
    }

    /// 静默告警的截止时间。已告警时为 `None`。
    pub fn silence_deadline(&self) -> Option<Instant> {
        self.running
            .filter(|r| !r.warned)
            .map(|r| r.last_ack + self.interval * 2 + Duration::from_millis(1))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.next_probe(), self.silence_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_probe_sent(&mut self, now: Instant) {
        if let Some(running) = self.running.as_mut() {
            running.next_probe = now + self.interval;
        }
    }

    /// 静默超过两个周期且尚未告警时返回静默时长，并标记为已告警。
    pub fn check_silence(&mut self, now: Instant) -> Option<Duration> {
        let limit = self.interval * 2;
        let running = self.running.as_mut()?;
        let silent = now.saturating_duration_since(running.last_ack);
        if running.warned || silent <= limit {
            return None;
        }
        running.warned = true;
        warn!("[心跳监视器] 已有 {}ms 未收到心跳应答。", silent.as_millis());
        Some(silent)
    }

    /// 记录一次应答。返回此前是否处于告警状态。
    pub fn on_ack(&mut self, now: Instant) -> bool {
        match self.running.as_mut() {
            Some(running) => {
                running.last_ack = now;
                std::mem::replace(&mut running.warned, false)
            }
            None => false,
        }
    }

    /// 当前挂起的计时器个数。
    pub fn active_timers(&self) -> usize {
        match self.running {
            Some(r) if r.warned => 1,
            Some(_) => 2,
            None => 0,
        }
    }
}
