// rust_websocket_utils/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和通信逻辑。
//!
//! 这是一个最小化的服务端：每个连接完成握手后拆分为 `ConnectionHandler`（发送端）
//! 和接收流，一并交给调用方提供的 `on_connect` 回调。通信模块的集成测试用它扮演远端分析服务。

use std::net::SocketAddr;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt,
    StreamExt,
};
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message, WebSocketStream};

use crate::error::WsError;
use crate::message::WsMessage;

/// `ServerWsStream` 是经过 WebSocket 握手后的 TCP 流。
pub type ServerWsStream = WebSocketStream<TcpStream>;
/// 服务端单个连接的接收流。
pub type ServerWsReceiver = SplitStream<ServerWsStream>;

/// 服务端单个连接的发送端。
pub struct ConnectionHandler {
    ws_sender: SplitSink<ServerWsStream, Message>,
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send_message(&mut self, message: &WsMessage) -> Result<(), WsError> {
        let text = message.to_json_string()?;
        self.send_text(text).await
    }

    /// 发送原始文本帧，测试中可以借此构造非法帧。
    pub async fn send_text(&mut self, text: String) -> Result<(), WsError> {
        self.ws_sender.send(Message::Text(text)).await?;
        Ok(())
    }

    /// 主动关闭连接。
    pub async fn close(&mut self) {
        if let Err(e) = self.ws_sender.close().await {
            debug!("服务端：关闭与 {} 的连接时出现错误: {}", self.peer_addr, e);
        }
    }
}

/// 已绑定监听地址、尚未开始接受连接的服务器。
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl WsServer {
    /// 绑定监听地址。传入端口 `0` 时由系统分配，可通过 `local_addr` 取得实际地址。
    pub async fn bind(addr: &str) -> Result<WsServer, WsError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket 服务器正在监听地址: {}", local_addr);
        Ok(WsServer { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 持续接受连接，每个连接在独立任务中完成握手并调用 `on_connect`。
    ///
    /// 只有接受连接本身不可恢复地失败时才会返回；单个连接的握手失败只记录日志。
    pub async fn serve<F, Fut>(self, on_connect: F) -> Result<(), WsError>
    where
        F: Fn(ConnectionHandler, ServerWsReceiver) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("从 {} 接受了新的 TCP 连接", peer_addr);
                    let on_connect_callback = on_connect.clone();
                    tokio::spawn(async move {
                        match accept_async(tcp_stream).await {
                            Ok(ws_stream) => {
                                info!("与 {} 的 WebSocket 握手成功", peer_addr);
                                let (ws_sender, ws_receiver) = ws_stream.split();
                                let handler = ConnectionHandler { ws_sender, peer_addr };
                                on_connect_callback(handler, ws_receiver).await;
                            }
                            Err(e) => {
                                error!("与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("接受 TCP 连接失败: {}。服务器将继续运行。", e);
                }
            }
        }
    }
}

/// 从服务端接收流读取下一条 `WsMessage`。连接关闭时返回 `None`。
pub async fn receive_message(ws_receiver: &mut ServerWsReceiver) -> Option<Result<WsMessage, WsError>> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => break Some(WsMessage::from_json_str(&text)),
            Some(Ok(Message::Close(_))) | None => break None,
            Some(Ok(Message::Binary(_))) => {
                break Some(Err(WsError::Message("服务端收到了非预期的二进制消息".to_string())));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(Err(WsError::Protocol(e))),
        }
    }
}
