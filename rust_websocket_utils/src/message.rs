// rust_websocket_utils/src/message.rs

//! 定义 WebSocket 通信中使用的核心消息结构。
//!
//! 本模块主要包含 `WsMessage` 结构体的定义及其相关实现。
//! `WsMessage` 是客户端与分析服务之间所有 WebSocket 帧的统一信封，
//! 两个方向使用相同的 JSON 结构：
//!
//! ```json
//! {"eventType": "image_analysis", "data": {...}, "timestamp": 1700000000000, "sessionId": "s1", "messageId": "..."}
//! ```

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::WsError;

/// 信封中的时间戳。
///
/// 出站消息总是写入毫秒整数；服务端的部分实现会写入 ISO-8601 字符串，入站时两种形式都接受。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum WsTimestamp {
    /// 自 Unix 纪元以来的毫秒数。
    Millis(i64),
    /// ISO-8601 文本，可能不带时区（按本地时间解释）。
    Text(String),
}

impl WsTimestamp {
    pub fn now() -> Self {
        WsTimestamp::Millis(Utc::now().timestamp_millis())
    }

    /// 转换为毫秒时间戳，无法解析的文本返回 `None`。
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            WsTimestamp::Millis(ms) => Some(*ms),
            WsTimestamp::Text(text) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Some(parsed.timestamp_millis());
                }
                let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
                Local
                    .from_local_datetime(&naive)
                    .single()
                    .map(|local| local.timestamp_millis())
            }
        }
    }
}

/// `WsMessage` 代表客户端与服务端之间交换的一帧消息。
///
/// # 字段
/// - `event_type`: 消息的业务类型（例如 `"image_analysis"`、`"text_stream"`），接收方据此解释 `data`。
/// - `data`: 业务数据，JSON 对象。入站帧缺失时为 `null`。
/// - `timestamp`: 发送时刻。
/// - `session_id`: 可选的会话 ID，一次图像分析对应一个会话。
/// - `message_id`: 可选的消息 ID，请求/响应关联时使用。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
    pub event_type: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WsTimestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl WsMessage {
    /// 创建一个新的 `WsMessage` 实例，时间戳取当前 UTC 毫秒。
    ///
    /// `data` 会被序列化为 JSON 值；序列化失败时返回 `WsError::Serialization`。
    pub fn new<T: Serialize>(event_type: impl Into<String>, data: &T) -> Result<WsMessage, WsError> {
        let data = serde_json::to_value(data)
            .map_err(|e| WsError::Serialization(format!("创建 WsMessage 时序列化载荷失败: {}", e)))?;
        Ok(Self::from_value(event_type, data))
    }

    /// 以已经是 JSON 值的 `data` 创建消息。
    pub fn from_value(event_type: impl Into<String>, data: serde_json::Value) -> WsMessage {
        WsMessage {
            event_type: event_type.into(),
            data,
            timestamp: Some(WsTimestamp::now()),
            session_id: None,
            message_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// 生成新的关联 ID（UUID v4）。
    pub fn new_message_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// 时间戳的毫秒值，缺失或无法解析时为 `None`。
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.timestamp.as_ref().and_then(WsTimestamp::as_millis)
    }

    /// 将 `data` 反序列化为指定类型。缺失的 `data` 按空对象处理。
    pub fn deserialize_data<T: DeserializeOwned>(&self) -> Result<T, WsError> {
        let value = if self.data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.data.clone()
        };
        serde_json::from_value(value).map_err(|e| {
            WsError::Deserialization(format!(
                "消息 '{}' 的 data 反序列化失败: {}",
                self.event_type, e
            ))
        })
    }

    /// 序列化为一帧 JSON 文本。
    pub fn to_json_string(&self) -> Result<String, WsError> {
        serde_json::to_string(self)
            .map_err(|e| WsError::Serialization(format!("消息序列化为JSON失败: {}", e)))
    }

    /// 从一帧 JSON 文本解析消息。
    ///
    /// 文本不是合法 JSON、不是对象，或 `eventType` 缺失/为空时返回 `WsError::Deserialization`。
    pub fn from_json_str(text: &str) -> Result<WsMessage, WsError> {
        let message: WsMessage = serde_json::from_str(text).map_err(|e| {
            WsError::Deserialization(format!("收到的文本反序列化为 WsMessage 失败: {}", e))
        })?;
        if message.event_type.trim().is_empty() {
            return Err(WsError::Deserialization("消息缺少 eventType".to_string()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_models::ws_payloads::{HeartbeatPayload, TextStreamData, HEARTBEAT_EVENT};
    use serde_json::json;

    #[test]
    fn test_ws_message_new_sets_envelope_fields() {
        let message = WsMessage::new(HEARTBEAT_EVENT, &HeartbeatPayload { timestamp: 7 })
            .expect("创建心跳消息失败");
        assert_eq!(message.event_type, "heartbeat");
        assert_eq!(message.data, json!({ "timestamp": 7 }));
        assert!(message.timestamp_millis().unwrap_or_default() > 0, "时间戳应自动生成");
        assert!(message.session_id.is_none());
        assert!(message.message_id.is_none());
    }

    #[test]
    fn test_wire_format_is_camel_case_and_skips_absent_ids() {
        let message = WsMessage::from_value("image_analysis", json!({ "imageData": "abc" }))
            .with_session_id("s1");
        let text = message.to_json_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["eventType"], "image_analysis");
        assert_eq!(value["sessionId"], "s1");
        assert!(value.get("messageId").is_none(), "未设置的 messageId 不应出现在线上帧中");
        assert!(value["timestamp"].is_i64(), "出站时间戳应为毫秒整数");
    }

    #[test]
    fn test_from_json_str_accepts_iso_timestamp_and_missing_data() {
        let parsed = WsMessage::from_json_str(
            r#"{"eventType":"pong","timestamp":"2024-05-01T12:00:00.123456"}"#,
        )
        .expect("带 ISO 时间戳的帧应能解析");
        assert_eq!(parsed.event_type, "pong");
        assert!(parsed.data.is_null());
        assert!(parsed.timestamp_millis().is_some(), "ISO 时间戳应能换算为毫秒");

        let rfc = WsMessage::from_json_str(r#"{"eventType":"pong","timestamp":"2024-05-01T12:00:00Z"}"#).unwrap();
        assert_eq!(rfc.timestamp_millis(), Some(1_714_564_800_000));
    }

    #[test]
    fn test_from_json_str_rejects_invalid_frames() {
        for text in ["not json", "[1,2,3]", r#"{"data":{}}"#, r#"{"eventType":"  "}"#] {
            let result = WsMessage::from_json_str(text);
            assert!(
                matches!(result, Err(WsError::Deserialization(_))),
                "帧 '{}' 应被判定为解析错误，实际: {:?}",
                text,
                result
            );
        }
    }

    #[test]
    fn test_deserialize_data_to_typed_payload() {
        let message = WsMessage::from_json_str(
            r#"{"eventType":"text_stream","data":{"content":"你好","is_final":false},"timestamp":1}"#,
        )
        .unwrap();
        let data: TextStreamData = message.deserialize_data().expect("text_stream 数据应能解析");
        assert_eq!(data.body(), "你好");

        let empty = WsMessage::from_json_str(r#"{"eventType":"text_stream"}"#).unwrap();
        let data: TextStreamData = empty.deserialize_data().expect("缺失 data 时应按空对象处理");
        assert_eq!(data.body(), "");

        let mismatched = WsMessage::from_value("text_stream", json!({ "is_final": "yes" }));
        let result: Result<TextStreamData, WsError> = mismatched.deserialize_data();
        assert!(matches!(result, Err(WsError::Deserialization(_))), "字段类型不匹配应返回解析错误");
    }
}
