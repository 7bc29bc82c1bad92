// rust_websocket_utils/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! 提供在指定地址监听、完成握手，并把每个连接的发送端与接收流交给回调处理的最小服务端。

pub mod transport;
