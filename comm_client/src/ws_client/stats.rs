// comm_client/src/ws_client/stats.rs

//! 连接统计。计数只增不减，只有显式重置才会清零。

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// 入站帧的平均传输延迟（接收时刻减去帧内时间戳）。
    pub average_latency_ms: f64,
    /// 参与平均延迟计算的帧数。
    pub latency_samples: u64,
    /// 最近一次进入已连接状态的时刻。
    pub connected_since: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// 记录一帧入站消息。`sent_at_ms` 为帧内时间戳，缺失或无法解析时不计入延迟。
    pub fn record_received(&mut self, bytes: usize, now: DateTime<Utc>, sent_at_ms: Option<i64>) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
        self.last_message_at = Some(now);
        if let Some(sent_at) = sent_at_ms {
            let latency = (now.timestamp_millis() - sent_at).max(0) as f64;
            let n = self.latency_samples as f64;
            self.average_latency_ms = (self.average_latency_ms * n + latency) / (n + 1.0);
            self.latency_samples += 1;
        }
    }

    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.connected_since = Some(now);
    }

    /// 从最近一次连接成功到 `now` 的毫秒数。
    pub fn uptime_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.connected_since.map(|since| (now - since).num_milliseconds())
    }
}
