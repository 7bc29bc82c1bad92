// rust_websocket_utils/src/error.rs

//! 传输层错误。

use thiserror::Error;

/// 信封编解码与 WebSocket 传输中可能出现的错误。
///
/// 上层（通信模块）把它归并为自己的错误分类：解析类错误不影响连接，其余视为连接故障。
#[derive(Error, Debug)]
pub enum WsError {
    #[error("序列化错误: {0}")]
    Serialization(String),

    /// 收到的帧不是合法 JSON，或缺少必需字段。
    #[error("反序列化错误: {0}")]
    Deserialization(String),

    /// 握手失败、连接被重置等协议层错误。
    #[error("WebSocket协议错误: {0}")]
    Protocol(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    /// 其他无法归类的问题，例如收到了非文本帧。
    #[error("消息错误: {0}")]
    Message(String),
}
