// comm_client/src/ws_client/pending.rs

//! 等待响应的请求。以 `messageId` 为键，响应到达、超时或模块停止时移除。

use std::collections::HashMap;

use log::debug;
use rust_websocket_utils::message::WsMessage;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::CommError;

pub type ReplySender = oneshot::Sender<Result<WsMessage, CommError>>;

#[derive(Debug)]
struct PendingEntry {
    reply: ReplySender,
    deadline: Instant,
    event_type: String,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message_id: String, event_type: String, deadline: Instant, reply: ReplySender) {
        self.entries.insert(
            message_id,
            PendingEntry {
                reply,
                deadline,
                event_type,
            },
        );
    }

    /// 用响应完成对应的请求。没有匹配的请求时返回 `false`。
    pub fn resolve(&mut self, message_id: &str, response: WsMessage) -> bool {
        match self.entries.remove(message_id) {
            Some(entry) => {
                debug!("[通信模块] 请求 {} ({}) 已收到响应。", message_id, entry.event_type);
                let _ = entry.reply.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// 以超时错误结束所有已到期的请求，返回个数。
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                let _ = entry.reply.send(Err(CommError::Timeout(format!(
                    "请求 {} ({}) 未在截止时间前收到响应",
                    id, entry.event_type
                ))));
            }
        }
        expired.len()
    }

    /// 以给定原因拒绝全部请求，返回个数。
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.reply.send(Err(CommError::RequestRejected(reason.to_string())));
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
