// comm_client/src/ws_client/mod.rs

//! 与远端分析服务之间的 WebSocket 连接管理。
//!
//! # 主要职责
//! - **连接管理**: 建立连接、等待服务端握手确认，断线后按指数退避自动重连。
//! - **消息收发**: 未连接时把出站消息暂存在有界队列中，连接恢复后按原顺序补发；
//!   入站消息解析后按 `eventType` 分发，业务消息转发到事件通道。
//! - **心跳**: 已连接时定期发送探测，长时间无应答时发布一次警告。
//! - **运行时配置**: 热更新服务器地址、在真实服务器与本地模拟后端之间切换，相同补丁只生效一次。
//!
//! # 核心组件
//! - `service::ConnectionManager`: 对外句柄，内部由一个独占全部可变状态的后台任务驱动。
//! - `transport::Transport`: 传输层接口，生产环境使用 `WebSocketTransport`。
//! - 其余子模块是状态机的组成部分，各自只负责一件事，不直接操作连接。

pub mod backoff;
pub mod dispatcher;
pub mod heartbeat;
#[cfg(test)]
pub(crate) mod mock_transport;
pub mod pending;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod simulated;
pub mod stats;
pub mod transport;

pub use service::{ConnectionManager, ManagerSnapshot};
pub use stats::Stats;
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};
