// rust_websocket_utils/src/client/mod.rs

//! WebSocket 客户端模块。
//!
//! 主要职责包括：
//! - **连接建立**: 校验 URL 并连接到远程 WebSocket 服务器。
//! - **消息传输**: 发送 `WsMessage`，接收原始文本帧或解析后的信封。
//!
//! 重连、心跳与发送队列等策略不在这里实现，由上层的连接管理器负责。

pub mod transport;
