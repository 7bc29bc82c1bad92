// common_models/src/ws_payloads.rs

//! 包含 WebSocket 通信中使用的各种 Payload 结构体定义。
//!
//! 线上信封格式为 `{eventType, data, timestamp, sessionId?, messageId?}`，
//! 本模块只描述 `data` 字段在不同 `eventType` 下的结构。字段命名与服务端保持一致，
//! 因此大多数结构体使用 camelCase，`is_final` 等少数字段按服务端原样保留。

use serde::{Deserialize, Serialize};

// --- 入站事件类型 ---

/// 服务端握手确认。
pub const CONNECTED_EVENT: &str = "connected";
pub const PONG_EVENT: &str = "pong";
pub const HEARTBEAT_ACK_EVENT: &str = "heartbeat_ack";
pub const PROCESSING_EVENT: &str = "processing";
pub const TEXT_STREAM_EVENT: &str = "text_stream";
pub const TEXT_RESULT_EVENT: &str = "text_result";
pub const FINAL_RESULT_EVENT: &str = "final_result";
pub const ANALYSIS_COMPLETE_EVENT: &str = "analysis_complete";
pub const ERROR_EVENT: &str = "error";

// --- 出站事件类型 ---

pub const IMAGE_ANALYSIS_EVENT: &str = "image_analysis";
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// `processing` 未携带提示文字时使用的默认值。
pub const DEFAULT_PROCESSING_MESSAGE: &str = "正在处理...";
/// `error` 未携带错误描述时使用的默认值。
pub const DEFAULT_SERVER_ERROR: &str = "未知错误";
/// `error` 未携带错误码时使用的默认值。
pub const DEFAULT_SERVER_ERROR_CODE: &str = "UNKNOWN_ERROR";

/// 心跳探测负载。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HeartbeatPayload {
    /// 发送时刻，自 Unix 纪元以来的毫秒数。
    pub timestamp: i64,
}

/// `image_analysis` 出站负载：base64 图像与会话信息。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysisPayload {
    pub image_data: String,
    pub session_id: String,
    pub timestamp: i64,
    /// 图像编码格式，目前固定为 `"base64"`。
    pub format: String,
    /// 采集端是否已对图像做过压缩。
    pub compression: bool,
}

impl ImageAnalysisPayload {
    pub fn base64(image_data: String, session_id: String, timestamp: i64, compression: bool) -> Self {
        Self {
            image_data,
            session_id,
            timestamp,
            format: "base64".to_string(),
            compression,
        }
    }
}

/// `connected` 入站数据。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedData {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `processing` 入站数据。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ProcessingData {
    pub fn message_or_default(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| DEFAULT_PROCESSING_MESSAGE.to_string())
    }
}

/// `text_stream` / `text_result` 入站数据。
///
/// 服务端在不同版本中分别使用 `content` 与 `text` 承载文本，两者都接受。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TextStreamData {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default, rename = "is_final")]
    pub is_final: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl TextStreamData {
    /// 流式文本：优先 `content`，其次 `text`。
    pub fn body(&self) -> String {
        self.content
            .clone()
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }
}

/// `final_result` 入站数据。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FinalResultData {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl FinalResultData {
    /// 最终文本：优先 `text`，其次 `content`。
    pub fn body(&self) -> String {
        self.text
            .clone()
            .or_else(|| self.content.clone())
            .unwrap_or_default()
    }
}

/// `analysis_complete` 入站数据。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCompleteData {
    #[serde(default)]
    pub final_text: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AnalysisCompleteData {
    pub fn body(&self) -> String {
        self.final_text
            .clone()
            .or_else(|| self.text.clone())
            .unwrap_or_default()
    }
}

/// `error` 入站数据。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorData {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ServerErrorData {
    /// 错误描述：优先 `error`，其次 `message`，都缺失时为“未知错误”。
    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| DEFAULT_SERVER_ERROR.to_string())
    }

    pub fn code(&self) -> String {
        self.error_code
            .clone()
            .unwrap_or_else(|| DEFAULT_SERVER_ERROR_CODE.to_string())
    }
}

/// HTTP 备用通道 `POST {basePath}/analyze` 的请求体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub image_data: String,
    pub session_id: String,
    pub timestamp: i64,
}

/// HTTP 备用通道的响应体，只关心 `text` 字段。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AnalyzeResponse {
    #[serde(default)]
    pub text: Option<String>,
}

/// `GET {basePath}/health` 的响应体。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl HealthResponse {
    /// 服务端报告 `healthy` 或 `ok` 即视为健康。
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy" || self.status == "ok"
    }
}
