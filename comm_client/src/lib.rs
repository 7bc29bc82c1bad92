//! `comm_client`：SeeForMe 移动端的通信模块。
//!
//! 本 crate 的核心是 [`ws_client::service::ConnectionManager`]：它持有与远端分析服务的
//! WebSocket 连接，负责断线重连（指数退避）、心跳监测、断线期间的出站消息缓存、
//! HTTP 备用通道，以及服务器地址与模拟/真实后端的热切换。
//!
//! 其余消费方（采集管线、语音播报、界面）不接触底层连接，只通过 [`event::EventBus`]
//! 交换带类型的命令与通知。
//!
//! 模块划分：
//! - `config`: 连接配置、配置文件加载、运行时配置补丁与校验。
//! - `error`: 通信模块的错误分类。
//! - `event`: 带类型的发布/订阅事件通道。
//! - `ws_client`: 连接管理器及其组成部分（队列、心跳、重连、统计、请求关联、模拟后端）。
//! - `api_client`: 基于 `reqwest` 的 HTTP 备用通道与健康检查。

pub mod api_client;
pub mod config;
pub mod error;
pub mod event;
pub mod ws_client;

pub use config::{
    ConnectionConfig, HeartbeatConfigPatch, HttpConfigPatch, ReconnectConfigPatch, RuntimeConfigPatch, ServerConfig,
    ServerConfigPatch,
};
pub use error::{CommError, ConfigError};
pub use event::{CommCommand, CommEvent, EventBus, EventTopic};
pub use ws_client::service::ConnectionManager;
