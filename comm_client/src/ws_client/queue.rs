// comm_client/src/ws_client/queue.rs

//! 有界出站队列。连接不可用时暂存消息，恢复后按插入顺序补发；满时丢弃最早的一条。

use std::collections::VecDeque;

use rust_websocket_utils::message::WsMessage;

#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<WsMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加到队尾，返回因溢出而被丢弃的最早消息。
    pub fn push(&mut self, message: WsMessage) -> Option<WsMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(message);
        evicted
    }

    /// 放回队首。补发失败时使用，保证下一次补发仍从这条开始。
    pub fn push_front(&mut self, message: WsMessage) -> Option<WsMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_back()
        } else {
            None
        };
        self.items.push_front(message);
        evicted
    }

    pub fn pop_front(&mut self) -> Option<WsMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 清空队列，返回被丢弃的条数。
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
