//! 通用枚举模块。
//!
//! 本模块定义了通信模块与其消费方共享的枚举类型。
//! 这些枚举提供类型安全，确保连接状态、事件类型等概念在整个系统中有一致的表示。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ws_payloads::{
    ANALYSIS_COMPLETE_EVENT, CONNECTED_EVENT, ERROR_EVENT, FINAL_RESULT_EVENT,
    HEARTBEAT_ACK_EVENT, PONG_EVENT, PROCESSING_EVENT, TEXT_RESULT_EVENT, TEXT_STREAM_EVENT,
};

/// 通信模块的连接状态。
///
/// 任意时刻只有一个状态处于活动状态，且只由连接管理器修改。
/// 序列化为小写下划线形式（例如 `"reconnecting"`），与前端约定一致。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 未连接。模块初始状态，也是 `stop()` 之后的状态。
    #[default]
    Disconnected,
    /// 正在建立连接（握手进行中）。
    Connecting,
    /// 已连接，并已收到服务端的 `connected` 确认。
    Connected,
    /// 连接断开后等待下一次重连。
    Reconnecting,
    /// 连接失败且不再自动重试（例如重连次数耗尽）。
    Error,
    /// 使用本地模拟后端，不持有真实连接，但在发送语义上视为“已连接”。
    Offline,
}

impl ConnectionState {
    /// 返回状态的线上名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Offline => "offline",
        }
    }

    /// 当前状态下发送的消息是否能被立即处理（真实连接或模拟后端）。
    pub fn can_deliver(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Offline)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 连接时通过查询参数 `clientType` 上报的客户端类型。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Mobile,
    Desktop,
}

impl ClientType {
    pub fn as_query_value(&self) -> &'static str {
        match self {
            ClientType::Mobile => "mobile",
            ClientType::Desktop => "desktop",
        }
    }
}

/// 入站消息中可识别的事件类型。
///
/// 未列出的 `eventType` 由分发器记录日志后丢弃。序列化名称与线上名称一致。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InboundEventType {
    /// 服务端握手确认，可能携带客户端 ID。
    Connected,
    Pong,
    HeartbeatAck,
    /// 服务端处理进度提示。
    Processing,
    TextStream,
    TextResult,
    FinalResult,
    AnalysisComplete,
    /// 服务端报告的处理失败。
    Error,
}

impl InboundEventType {
    /// 从线上名称解析事件类型，无法识别时返回 `None`。
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            CONNECTED_EVENT => Some(Self::Connected),
            PONG_EVENT => Some(Self::Pong),
            HEARTBEAT_ACK_EVENT => Some(Self::HeartbeatAck),
            PROCESSING_EVENT => Some(Self::Processing),
            TEXT_STREAM_EVENT => Some(Self::TextStream),
            TEXT_RESULT_EVENT => Some(Self::TextResult),
            FINAL_RESULT_EVENT => Some(Self::FinalResult),
            ANALYSIS_COMPLETE_EVENT => Some(Self::AnalysisComplete),
            ERROR_EVENT => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => CONNECTED_EVENT,
            Self::Pong => PONG_EVENT,
            Self::HeartbeatAck => HEARTBEAT_ACK_EVENT,
            Self::Processing => PROCESSING_EVENT,
            Self::TextStream => TEXT_STREAM_EVENT,
            Self::TextResult => TEXT_RESULT_EVENT,
            Self::FinalResult => FINAL_RESULT_EVENT,
            Self::AnalysisComplete => ANALYSIS_COMPLETE_EVENT,
            Self::Error => ERROR_EVENT,
        }
    }

    /// 心跳应答类消息（`pong` / `heartbeat_ack`），只在内部处理，不向消费方转发。
    pub fn is_heartbeat_ack(&self) -> bool {
        matches!(self, Self::Pong | Self::HeartbeatAck)
    }

    /// 会话终结类消息，处理后还会额外发布“处理完成”通知。
    pub fn is_terminal_result(&self) -> bool {
        matches!(self, Self::FinalResult | Self::AnalysisComplete)
    }
}
