// comm_client/src/ws_client/dispatcher.rs

//! 入站消息分类。
//!
//! 握手确认和心跳应答交给连接管理器内部处理；业务消息转换为一组要发布的通知；
//! 无法识别的 `eventType` 只记录日志。`data` 字段与约定结构不符时返回 `ProtocolParse` 错误。

use common_models::enums::InboundEventType;
use common_models::ws_payloads::{
    AnalysisCompleteData, ConnectedData, FinalResultData, ProcessingData, ServerErrorData, TextStreamData,
};
use rust_websocket_utils::message::WsMessage;

use crate::error::CommError;
use crate::event::{CommEvent, ReceivedMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    PeerAck {
        client_id: Option<String>,
        message: Option<String>,
    },
    HeartbeatAck,
    /// 需要按顺序发布的通知。
    Notify(Vec<CommEvent>),
    Unknown(String),
}

pub fn classify(message: &WsMessage) -> Result<Inbound, CommError> {
    let Some(kind) = InboundEventType::parse(&message.event_type) else {
        return Ok(Inbound::Unknown(message.event_type.clone()));
    };
    // 会话 ID 优先取 data 中的值，其次取信封上的值
    let session = |from_data: Option<String>| from_data.or_else(|| message.session_id.clone());

    let inbound = match kind {
        InboundEventType::Connected => {
            let data: ConnectedData = message.deserialize_data()?;
            Inbound::PeerAck {
                client_id: data.client_id,
                message: data.message,
            }
        }
        InboundEventType::Pong | InboundEventType::HeartbeatAck => Inbound::HeartbeatAck,
        InboundEventType::Processing => {
            let data: ProcessingData = message.deserialize_data()?;
            Inbound::Notify(vec![CommEvent::Processing {
                message: data.message_or_default(),
                session_id: session(data.session_id),
            }])
        }
        InboundEventType::TextStream | InboundEventType::TextResult => {
            let data: TextStreamData = message.deserialize_data()?;
            Inbound::Notify(vec![CommEvent::MessageReceived(ReceivedMessage {
                event_type: kind,
                text: Some(data.body()),
                is_final: data.is_final,
                session_id: session(data.session_id),
                data: message.data.clone(),
            })])
        }
        InboundEventType::FinalResult => {
            let data: FinalResultData = message.deserialize_data()?;
            terminal(kind, message, data.body(), session(data.session_id))
        }
        InboundEventType::AnalysisComplete => {
            let data: AnalysisCompleteData = message.deserialize_data()?;
            terminal(kind, message, data.body(), session(data.session_id))
        }
        InboundEventType::Error => {
            let data: ServerErrorData = message.deserialize_data()?;
            Inbound::Notify(vec![CommEvent::ServerError {
                error: data.error_text(),
                code: data.code(),
                session_id: session(data.session_id),
            }])
        }
    };
    Ok(inbound)
}

fn terminal(kind: InboundEventType, message: &WsMessage, text: String, session_id: Option<String>) -> Inbound {
    Inbound::Notify(vec![
        CommEvent::MessageReceived(ReceivedMessage {
            event_type: kind,
            text: Some(text.clone()),
            is_final: true,
            session_id: session_id.clone(),
            data: message.data.clone(),
        }),
        CommEvent::ProcessingComplete { session_id, text },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_and_heartbeat_are_internal() {
        let ack = WsMessage::from_value("connected", json!({ "clientId": "c-1", "message": "欢迎" }));
        assert_eq!(
            classify(&ack).unwrap(),
            Inbound::PeerAck {
                client_id: Some("c-1".to_string()),
                message: Some("欢迎".to_string())
            }
        );
        let bare = WsMessage::from_json_str(r#"{"eventType":"connected"}"#).unwrap();
        assert!(matches!(classify(&bare).unwrap(), Inbound::PeerAck { client_id: None, .. }));
        for name in ["pong", "heartbeat_ack"] {
            assert_eq!(classify(&WsMessage::from_value(name, json!({}))).unwrap(), Inbound::HeartbeatAck);
        }
    }

    #[test]
    fn test_final_result_also_reports_processing_complete() {
        let message = WsMessage::from_value("final_result", json!({ "text": "室内场景" })).with_session_id("s9");
        let Inbound::Notify(events) = classify(&message).unwrap() else {
            panic!("final_result 应转换为通知");
        };
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CommEvent::MessageReceived(m) if m.text.as_deref() == Some("室内场景") && m.is_final
                && m.session_id.as_deref() == Some("s9")
        ), "会话 ID 缺失时应取信封上的值");
        assert_eq!(
            events[1],
            CommEvent::ProcessingComplete {
                session_id: Some("s9".to_string()),
                text: "室内场景".to_string()
            }
        );
    }

    #[test]
    fn test_field_fallbacks() {
        let message = WsMessage::from_value("text_result", json!({ "text": "片段", "sessionId": "s1" }));
        let Inbound::Notify(events) = classify(&message).unwrap() else { panic!() };
        assert!(matches!(&events[0], CommEvent::MessageReceived(m) if m.text.as_deref() == Some("片段") && !m.is_final));

        let processing = WsMessage::from_value("processing", json!({}));
        assert_eq!(
            classify(&processing).unwrap(),
            Inbound::Notify(vec![CommEvent::Processing {
                session_id: None,
                message: "正在处理...".to_string()
            }])
        );

        let error = WsMessage::from_value("error", json!({ "message": "模型不可用" }));
        assert_eq!(
            classify(&error).unwrap(),
            Inbound::Notify(vec![CommEvent::ServerError {
                session_id: None,
                error: "模型不可用".to_string(),
                code: "UNKNOWN_ERROR".to_string()
            }])
        );
    }

    #[test]
    fn test_unknown_type_and_malformed_data() {
        let unknown = WsMessage::from_value("broadcast", json!({}));
        assert_eq!(classify(&unknown).unwrap(), Inbound::Unknown("broadcast".to_string()));

        let malformed = WsMessage::from_value("text_stream", json!({ "is_final": "是" }));
        assert!(matches!(classify(&malformed), Err(CommError::ProtocolParse(_))), "data 结构不符应返回解析错误");
    }
}
