// rust_websocket_utils/src/client/transport.rs

//! 客户端 WebSocket 传输层核心逻辑。
//!
//! 本模块提供建立与服务器的连接、发送 `WsMessage` 和接收原始文本帧的功能。
//! 帧的业务解析（以及解析失败时的统计与通知）交给上层，因此接收端同时提供
//! `receive_text`（原始文本）与 `receive_message`（解析后的信封）两种形式。

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt,
    StreamExt,
};
use log::{debug, error, info};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    tungstenite::Error as TungsteniteError,
    WebSocketStream,
};
use url::Url;

use crate::error::WsError;
use crate::message::WsMessage;

/// `ClientWsStream` 类型别名，代表一个可能经过 TLS 加密的 TCP WebSocket 流。
pub type ClientWsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// `ClientConnection` 代表一个活动的客户端 WebSocket 连接。
///
/// 它封装了发送端 (`SplitSink`) 和接收端 (`SplitStream`)，调用方可以把两端交给不同的任务。
pub struct ClientConnection {
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    pub ws_receiver: SplitStream<ClientWsStream>,
}

impl ClientConnection {
    /// 序列化并发送一个 `WsMessage`。
    pub async fn send_message(&mut self, message: &WsMessage) -> Result<(), WsError> {
        let msg_json = message.to_json_string()?;
        send_text(&mut self.ws_sender, msg_json).await?;
        debug!("客户端：消息已发送 (类型: {}, ID: {:?})", message.event_type, message.message_id);
        Ok(())
    }
}

/// 通过发送端写出一帧文本。
pub async fn send_text(
    ws_sender: &mut SplitSink<ClientWsStream, Message>,
    text: String,
) -> Result<(), WsError> {
    debug!("客户端：准备发送文本帧，长度 {} 字节", text.len());
    ws_sender.send(Message::Text(text)).await?;
    Ok(())
}

/// 向服务器发送 Close 帧并关闭发送端，错误只记录不返回。
pub async fn close_sender(ws_sender: &mut SplitSink<ClientWsStream, Message>) {
    if let Err(e) = ws_sender.close().await {
        debug!("客户端：关闭发送端时出现错误 (连接可能已断开): {}", e);
    }
}

/// 校验 WebSocket URL，只接受 `ws://` 与 `wss://`。
pub fn parse_ws_url(url_str: &str) -> Result<Url, WsError> {
    let parsed_url = Url::parse(url_str)
        .map_err(|e| WsError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;
    match parsed_url.scheme() {
        "ws" | "wss" => Ok(parsed_url),
        other => Err(WsError::InvalidUrl(format!(
            "WebSocket URL '{}' 的协议 '{}' 不受支持，应为 ws 或 wss",
            url_str, other
        ))),
    }
}

/// 异步连接到指定的 WebSocket 服务器。
///
/// 连接和握手成功后将流拆分为发送端和接收端，封装在 `ClientConnection` 中返回。
/// 本函数不设超时，调用方负责用自己的截止时间包住它。
pub async fn connect_client(url_str: &str) -> Result<ClientConnection, WsError> {
    info!("客户端：开始尝试连接到 WebSocket 服务器，URL: {}", url_str);
    let parsed_url = parse_ws_url(url_str)?;

    match connect_async(parsed_url.as_str()).await {
        Ok((ws_stream, response)) => {
            info!("客户端：已成功连接到 {} (HTTP 状态码: {})", url_str, response.status());
            let (ws_sender, ws_receiver) = ws_stream.split();
            Ok(ClientConnection { ws_sender, ws_receiver })
        }
        Err(e) => {
            error!("客户端：连接到 {} 失败，错误: {}", url_str, e);
            Err(WsError::Protocol(e))
        }
    }
}

/// 从接收端读取下一帧文本。
///
/// Ping/Pong 等控制帧由底层库处理，这里直接跳过。
///
/// # Returns
/// - `Some(Ok(text))`：收到一帧文本。
/// - `Some(Err(e))`：收到二进制帧或底层发生错误。
/// - `None`：连接已关闭。
pub async fn receive_text(ws_receiver: &mut SplitStream<ClientWsStream>) -> Option<Result<String, WsError>> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("客户端：收到原始文本消息，长度 {} 字节", text.len());
                break Some(Ok(text));
            }
            Some(Ok(Message::Binary(bin))) => {
                debug!("客户端：收到二进制消息，长度: {} 字节", bin.len());
                break Some(Err(WsError::Message("客户端收到了非预期的 WebSocket 二进制消息".to_string())));
            }
            Some(Ok(Message::Close(close_frame))) => {
                debug!("客户端：收到 Close 控制帧: {:?}", close_frame);
                break None;
            }
            Some(Ok(_)) => {
                // Ping / Pong / Frame
            }
            Some(Err(TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed)) => {
                debug!("客户端：连接已关闭。");
                break None;
            }
            Some(Err(e)) => {
                error!("客户端：从 WebSocket 流接收消息时发生底层错误: {}", e);
                break Some(Err(WsError::Protocol(e)));
            }
            None => {
                debug!("客户端：WebSocket 接收流已结束。");
                break None;
            }
        }
    }
}

/// 读取下一帧并解析为 `WsMessage`，语义同 `receive_text`。
pub async fn receive_message(ws_receiver: &mut SplitStream<ClientWsStream>) -> Option<Result<WsMessage, WsError>> {
    let text = receive_text(ws_receiver).await?;
    Some(text.and_then(|text| WsMessage::from_json_str(&text)))
}
