// comm_client/src/ws_client/transport.rs

//! 连接管理器与底层传输之间的接口。
//!
//! 连接管理器只看到 `TransportLink`：一个写入文本帧的发送端和一个读取 `TransportEvent` 的接收端。
//! `WebSocketTransport` 在 `rust_websocket_utils` 的客户端传输之上实现它，
//! 读写各由一个后台任务负责；测试中可以替换为基于通道的实现。

use futures_util::future::BoxFuture;
use log::{debug, error, warn};
use rust_websocket_utils::client::transport::{self as ws_transport, ClientConnection};
use rust_websocket_utils::error::WsError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CommError;

/// 底层连接上发生的事件。
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 收到一帧文本。
    Frame(String),
    /// 连接被对端正常关闭。
    Closed { reason: Option<String> },
    /// 连接因错误中断。
    Failed(String),
}

/// 一条已建立的连接。释放时后台写任务发送 Close 帧后退出，读任务被终止。
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(outbound: mpsc::UnboundedSender<String>, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            outbound,
            events,
            reader: None,
        }
    }

    /// 绑定读任务，连接释放时一并终止。
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// 写入一帧文本。写任务已经退出时返回 `CommError::Connection`。
    pub fn send(&self, text: String) -> Result<(), CommError> {
        self.outbound
            .send(text)
            .map_err(|_| CommError::Connection("连接的写通道已关闭".to_string()))
    }

    /// 等待下一个连接事件。读写任务都已结束时返回 `None`。
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// 传输层接口。`connect` 完成即表示底层连接已打开（不含业务握手）。
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportLink, CommError>>;
}

/// 基于 `rust_websocket_utils` 客户端传输的实现。
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<TransportLink, CommError>> {
        Box::pin(async move {
            let ClientConnection {
                mut ws_sender,
                mut ws_receiver,
            } = ws_transport::connect_client(&url).await?;

            let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
            let (event_tx, event_rx) = mpsc::unbounded_channel();

            let writer_events = event_tx.clone();
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = ws_transport::send_text(&mut ws_sender, text).await {
                        error!("[传输层] 写入帧失败: {}", e);
                        let _ = writer_events.send(TransportEvent::Failed(e.to_string()));
                        return;
                    }
                }
                debug!("[传输层] 写通道已释放，正在关闭连接。");
                ws_transport::close_sender(&mut ws_sender).await;
            });

            let reader = tokio::spawn(async move {
                loop {
                    match ws_transport::receive_text(&mut ws_receiver).await {
                        Some(Ok(text)) => {
                            if event_tx.send(TransportEvent::Frame(text)).is_err() {
                                break;
                            }
                        }
                        Some(Err(WsError::Message(detail))) => {
                            warn!("[传输层] 已忽略: {}", detail);
                        }
                        Some(Err(e)) => {
                            let _ = event_tx.send(TransportEvent::Failed(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = event_tx.send(TransportEvent::Closed { reason: None });
                            break;
                        }
                    }
                }
            });

            Ok(TransportLink::new(outbound_tx, event_rx).with_reader(reader))
        })
    }
}
