// comm_client/src/ws_client/mock_transport.rs

//! 测试用的内存传输。每次连接的行为按顺序从脚本中取出，脚本用完后使用默认行为。
//! 连接成功时把对端 (`MockPeer`) 交给测试，测试借此读取客户端写出的帧、推送入站帧或关闭连接。

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use rust_websocket_utils::message::WsMessage;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::transport::{Transport, TransportEvent, TransportLink};
use crate::error::CommError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// 立即失败。
    Fail,
    /// 永不返回，用于触发连接超时。
    Hang,
    /// 连接成功；`auto_ack` 为 `true` 时立即推送服务端握手确认。
    Accept { auto_ack: bool },
}

pub struct MockTransport {
    script: Mutex<VecDeque<MockBehavior>>,
    default: MockBehavior,
    attempts: Mutex<Vec<(Instant, String)>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockTransport {
    pub fn new(default: MockBehavior) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        Self::scripted(default, [])
    }

    pub fn scripted(
        default: MockBehavior,
        script: impl IntoIterator<Item = MockBehavior>,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let transport = Self {
            script: Mutex::new(script.into_iter().collect()),
            default,
            attempts: Mutex::new(Vec::new()),
            peers,
        };
        (std::sync::Arc::new(transport), peer_rx)
    }

    pub fn connect_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// 每次连接尝试发生的时刻。
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.attempts.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
    }
}

impl Transport for MockTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportLink, CommError>> {
        self.attempts.lock().unwrap().push((Instant::now(), url.clone()));
        let behavior = self.script.lock().unwrap().pop_front().unwrap_or(self.default);
        match behavior {
            MockBehavior::Fail => Box::pin(async { Err(CommError::Connection("模拟连接被拒绝".to_string())) }),
            MockBehavior::Hang => Box::pin(std::future::pending()),
            MockBehavior::Accept { auto_ack } => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                let peer = MockPeer {
                    url,
                    sent: Some(outbound_rx),
                    events: event_tx,
                };
                if auto_ack {
                    peer.ack(Some("mock-client"));
                }
                let _ = self.peers.send(peer);
                Box::pin(async move { Ok(TransportLink::new(outbound_tx, event_rx)) })
            }
        }
    }
}

/// 连接的服务端一侧。
pub struct MockPeer {
    pub url: String,
    sent: Option<mpsc::UnboundedReceiver<String>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockPeer {
    pub fn push(&self, frame: Value) {
        let _ = self.events.send(TransportEvent::Frame(frame.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Frame(text.to_string()));
    }

    pub fn ack(&self, client_id: Option<&str>) {
        self.push(json!({
            "eventType": "connected",
            "data": { "clientId": client_id, "message": "连接成功" },
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }));
    }

    pub fn pong(&self) {
        self.push(json!({ "eventType": "pong", "data": {} }));
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed {
            reason: Some("对端关闭".to_string()),
        });
    }

    /// 只关闭写方向，客户端之后的写入会失败，连接本身不报告断开。
    pub fn drop_writer(&mut self) {
        self.sent = None;
    }

    /// 客户端是否已经释放了这条连接。
    pub fn is_released(&self) -> bool {
        self.events.is_closed()
    }

    /// 取出客户端已写出的全部帧。
    pub fn drain_sent(&mut self) -> Vec<WsMessage> {
        let mut frames = Vec::new();
        if let Some(sent) = self.sent.as_mut() {
            while let Ok(text) = sent.try_recv() {
                frames.push(WsMessage::from_json_str(&text).expect("客户端写出的帧应能解析"));
            }
        }
        frames
    }
}
