//! `rust_websocket_utils` 是一个提供 WebSocket 通信实用功能的 Rust Crate。
//! 它封装了 JSON 信封消息的编解码，以及基于 `tokio-tungstenite` 的客户端和服务端传输层，
//! 与 `common_models` 中的负载类型配合使用。
//!
//! 主要模块包括：
//! - `message`: 定义线上信封结构 `WsMessage`（`{eventType, data, timestamp, sessionId?, messageId?}`）。
//! - `error`: 定义库中使用的统一错误类型 `WsError`。
//! - `client`: 提供 WebSocket 客户端传输层（连接、发送、接收）。
//! - `server`: 提供轻量的 WebSocket 服务端传输层，主要作为集成测试中的对端。

pub mod client;
pub mod error;
pub mod message;
pub mod server;
