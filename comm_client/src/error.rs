// comm_client/src/error.rs

//! 通信模块的错误类型定义。
//!
//! `CommError` 是对外暴露的错误分类；它需要随通知一起广播，也需要同时交给多个等待者，
//! 因此实现了 `Clone`，底层错误统一转换为描述文本保存。

use rust_websocket_utils::error::WsError;
use thiserror::Error;

/// 配置校验错误。校验失败时原有配置保持不变。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 地址字段为空。
    #[error("配置项 {field} 不能为空")]
    EmptyAddress { field: &'static str },

    /// 地址无法解析。
    #[error("配置项 {field} 的地址 '{value}' 无效: {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// 地址协议不被支持。
    #[error("配置项 {field} 的地址 '{value}' 协议不受支持，应为 {expected}")]
    UnsupportedScheme {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("basePath 必须以 '/' 开头: '{0}'")]
    InvalidBasePath(String),

    /// 数值类配置项取值非法。
    #[error("配置项 {field} 的取值无效: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// 通信模块的统一错误类型。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommError {
    /// 连接未能建立，或被异常关闭。可通过重连恢复。
    #[error("连接错误: {0}")]
    Connection(String),

    /// 连接尝试或 HTTP 请求超过截止时间。
    #[error("超时: {0}")]
    Timeout(String),

    /// 收到的帧不是合法 JSON 或缺少必需字段。该帧被丢弃，连接不受影响。
    #[error("协议解析错误: {0}")]
    ProtocolParse(String),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 自动重连次数已耗尽，需要手动重连。
    #[error("已达到最大重连次数 ({attempts}/{max})")]
    MaxAttemptsExceeded { attempts: u32, max: u32 },

    /// HTTP 备用通道请求失败（非 2xx 响应或网络错误）。
    #[error("HTTP 请求失败: {0}")]
    Http(String),

    /// 等待中的请求被模块停止或模式切换取消。
    #[error("请求已取消: {0}")]
    RequestRejected(String),

    /// 连接管理器的后台任务已经结束。
    #[error("通信模块未运行")]
    NotRunning,
}

impl From<WsError> for CommError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Deserialization(detail) => CommError::ProtocolParse(detail),
            other => CommError::Connection(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CommError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CommError::Timeout(format!("HTTP 请求超时: {}", err))
        } else if err.is_decode() {
            CommError::ProtocolParse(format!("HTTP 响应解析失败: {}", err))
        } else {
            CommError::Http(err.to_string())
        }
    }
}

impl CommError {
    /// 是否属于可通过重连恢复的连接级错误。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CommError::Connection(_) | CommError::Timeout(_))
    }
}
