// comm_client/src/event.rs

//! 通信模块与其消费方（采集、语音播报、界面）之间的事件通道。
//!
//! 消费方从不接触套接字细节，只通过两类强类型消息与连接管理器交互：
//! - `CommEvent`：连接管理器发布的通知；
//! - `CommCommand`：消费方投递给连接管理器的命令。
//!
//! `EventBus` 基于 `tokio::sync::broadcast`，可以任意克隆，所有克隆共享同一组通道。
//! 消费方既可以订阅全部通知，也可以通过 `subscribe_topic` / `on` 只关注某一类。

use common_models::enums::{ConnectionState, InboundEventType};
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, RuntimeConfigPatch};
use crate::error::CommError;

/// 通道的默认缓冲容量。
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// 一条已分发给消费方的入站业务消息。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub event_type: InboundEventType,
    pub session_id: Option<String>,
    /// 提取出的文本（流式片段或最终结果），没有文本的消息为 `None`。
    pub text: Option<String>,
    pub is_final: bool,
    /// 原始 `data` 字段。
    pub data: serde_json::Value,
}

/// 连接管理器发布的通知。
#[derive(Debug, Clone, PartialEq)]
pub enum CommEvent {
    /// 每次状态实际发生变化时发布一次。
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    /// 收到服务端的握手确认。
    Connected {
        client_id: Option<String>,
        message: Option<String>,
    },
    MessageReceived(ReceivedMessage),
    Processing {
        session_id: Option<String>,
        message: String,
    },
    /// 某个会话的最终结果已到达。
    ProcessingComplete {
        session_id: Option<String>,
        text: String,
    },
    /// 图像已交给发送管线。`queued` 为 `true` 表示暂存在出站队列中。
    ImageSent { session_id: String, queued: bool },
    SendError { event_type: String, error: CommError },
    /// 服务端通过 `error` 消息报告的处理失败。
    ServerError {
        session_id: Option<String>,
        error: String,
        code: String,
    },
    /// 运行时补丁生效后的完整配置。
    ConfigUpdated(Box<ConnectionConfig>),
    ModeSwitched { simulated: bool },
    /// 超过两个心跳周期未收到应答。每次静默只发布一次。
    HeartbeatTimeout { silent_ms: u64 },
    HeartbeatRecovered,
    MaxAttemptsExceeded { attempts: u32, max: u32 },
    Error(CommError),
    ModuleStarted,
    ModuleStopped,
}

/// 通知的主题，用于窄订阅。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    ConnectionState,
    Connected,
    MessageReceived,
    Processing,
    ProcessingComplete,
    ImageSent,
    SendError,
    ServerError,
    ConfigUpdated,
    ModeSwitched,
    /// 心跳超时与恢复。
    Heartbeat,
    MaxAttemptsExceeded,
    Error,
    /// 模块启动与停止。
    Lifecycle,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::ConnectionState => "connection_state_changed",
            EventTopic::Connected => "connected",
            EventTopic::MessageReceived => "message_received",
            EventTopic::Processing => "processing",
            EventTopic::ProcessingComplete => "processing_complete",
            EventTopic::ImageSent => "image_sent",
            EventTopic::SendError => "send_error",
            EventTopic::ServerError => "server_error",
            EventTopic::ConfigUpdated => "config_updated",
            EventTopic::ModeSwitched => "mode_switched",
            EventTopic::Heartbeat => "heartbeat",
            EventTopic::MaxAttemptsExceeded => "max_attempts_exceeded",
            EventTopic::Error => "error",
            EventTopic::Lifecycle => "lifecycle",
        }
    }
}

impl CommEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            CommEvent::ConnectionStateChanged { .. } => EventTopic::ConnectionState,
            CommEvent::Connected { .. } => EventTopic::Connected,
            CommEvent::MessageReceived(_) => EventTopic::MessageReceived,
            CommEvent::Processing { .. } => EventTopic::Processing,
            CommEvent::ProcessingComplete { .. } => EventTopic::ProcessingComplete,
            CommEvent::ImageSent { .. } => EventTopic::ImageSent,
            CommEvent::SendError { .. } => EventTopic::SendError,
            CommEvent::ServerError { .. } => EventTopic::ServerError,
            CommEvent::ConfigUpdated(_) => EventTopic::ConfigUpdated,
            CommEvent::ModeSwitched { .. } => EventTopic::ModeSwitched,
            CommEvent::HeartbeatTimeout { .. } | CommEvent::HeartbeatRecovered => EventTopic::Heartbeat,
            CommEvent::MaxAttemptsExceeded { .. } => EventTopic::MaxAttemptsExceeded,
            CommEvent::Error(_) => EventTopic::Error,
            CommEvent::ModuleStarted | CommEvent::ModuleStopped => EventTopic::Lifecycle,
        }
    }
}

/// 消费方投递给连接管理器的命令。
#[derive(Debug, Clone, PartialEq)]
pub enum CommCommand {
    /// 采集管线完成一次拍摄，`image_data` 为 base64 文本。
    CaptureCompleted { image_data: String, session_id: String },
    /// 触发开关变化。关闭时暂停连接，开启时恢复。
    TriggerEnabledChanged(bool),
    ConfigPatch(RuntimeConfigPatch),
}

/// 强类型的发布/订阅通道。
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<CommEvent>,
    commands: broadcast::Sender<CommCommand>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        Self { events, commands }
    }

    /// 发布一条通知。没有订阅者时通知被丢弃。
    pub fn publish(&self, event: CommEvent) {
        let topic = event.topic();
        if self.events.send(event).is_err() {
            debug!("[事件通道] 通知 '{}' 没有订阅者，已丢弃。", topic.as_str());
        }
    }

    /// 订阅全部通知。
    pub fn subscribe(&self) -> broadcast::Receiver<CommEvent> {
        self.events.subscribe()
    }

    /// 只订阅某一主题的通知。
    pub fn subscribe_topic(&self, topic: EventTopic) -> TopicSubscription {
        TopicSubscription {
            topic,
            receiver: self.events.subscribe(),
        }
    }

    /// 在后台任务中对某一主题的每条通知调用 `handler`。
    ///
    /// 通道关闭（所有 `EventBus` 克隆都被释放）后任务结束；也可以对返回的句柄调用 `abort`。
    pub fn on<F>(&self, topic: EventTopic, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(CommEvent) + Send + 'static,
    {
        let mut subscription = self.subscribe_topic(topic);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event);
            }
            debug!("[事件通道] 主题 '{}' 的处理任务已结束。", topic.as_str());
        })
    }

    /// 投递一条命令。没有连接管理器在监听时返回 `false`。
    pub fn dispatch(&self, command: CommCommand) -> bool {
        match self.commands.send(command) {
            Ok(_) => true,
            Err(_) => {
                warn!("[事件通道] 没有任何连接管理器在监听命令，命令已丢弃。");
                false
            }
        }
    }

    /// 订阅命令，供连接管理器使用。
    pub fn command_receiver(&self) -> broadcast::Receiver<CommCommand> {
        self.commands.subscribe()
    }
}

/// 单一主题的订阅。
#[derive(Debug)]
pub struct TopicSubscription {
    topic: EventTopic,
    receiver: broadcast::Receiver<CommEvent>,
}

impl TopicSubscription {
    pub fn topic(&self) -> EventTopic {
        self.topic
    }

    /// 等待下一条属于该主题的通知。通道关闭时返回 `None`。
    ///
    /// 订阅者处理过慢导致的积压溢出只记录警告，随后从最新位置继续。
    pub async fn recv(&mut self) -> Option<CommEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.topic() == self.topic => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[事件通道] 主题 '{}' 的订阅者落后，跳过了 {} 条通知。", self.topic.as_str(), skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞地取出下一条属于该主题的通知。
    pub fn try_recv(&mut self) -> Option<CommEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.topic() == self.topic => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_topic_subscription_filters_other_events() {
        let bus = EventBus::new();
        let mut states = bus.subscribe_topic(EventTopic::ConnectionState);

        bus.publish(CommEvent::ModuleStarted);
        bus.publish(CommEvent::ConnectionStateChanged {
            previous: ConnectionState::Disconnected,
            current: ConnectionState::Connecting,
        });
        bus.publish(CommEvent::HeartbeatRecovered);

        let event = timeout(Duration::from_secs(1), states.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(CommEvent::ConnectionStateChanged {
                previous: ConnectionState::Disconnected,
                current: ConnectionState::Connecting,
            })
        );
        assert_eq!(states.try_recv(), None, "其他主题的通知不应被投递");
    }

    #[tokio::test]
    async fn test_on_invokes_handler_for_matching_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = bus.on(EventTopic::Heartbeat, move |event| {
            seen_clone.lock().unwrap().push(event);
        });
        tokio::task::yield_now().await;

        bus.publish(CommEvent::HeartbeatTimeout { silent_ms: 2001 });
        bus.publish(CommEvent::ModuleStopped);
        bus.publish(CommEvent::HeartbeatRecovered);

        for _ in 0..20 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CommEvent::HeartbeatTimeout { silent_ms: 2001 }, CommEvent::HeartbeatRecovered],
            "处理函数应只收到心跳主题的通知，且顺序不变"
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_dispatch_without_listener_returns_false() {
        let bus = EventBus::new();
        assert!(!bus.dispatch(CommCommand::TriggerEnabledChanged(true)));

        let mut commands = bus.command_receiver();
        assert!(bus.dispatch(CommCommand::TriggerEnabledChanged(false)));
        assert_eq!(commands.recv().await.unwrap(), CommCommand::TriggerEnabledChanged(false));
    }

    #[test]
    fn test_received_message_serializes_event_name() {
        let message = ReceivedMessage {
            event_type: InboundEventType::TextStream,
            session_id: Some("s1".to_string()),
            text: Some("片段".to_string()),
            is_final: false,
            data: serde_json::json!({ "content": "片段" }),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["eventType"], "text_stream");
        assert_eq!(value["sessionId"], "s1");
    }
}
