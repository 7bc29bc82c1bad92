// comm_client/src/ws_client/simulated.rs

//! 本地模拟后端。
//!
//! 处于模拟模式时，`image_analysis` 请求不经过网络，而是在这里排出一组待投递的入站帧：
//! 延迟 `simulatedResponseDelayMs` 后依次产生三段流式文本和一条最终结果，相邻两帧间隔一秒。
//! 这些帧到期后由连接管理器交给与真实连接相同的分发流程。这里不启动任何后台任务。

use std::time::Duration;

use common_models::ws_payloads::{FINAL_RESULT_EVENT, TEXT_STREAM_EVENT};
use rust_websocket_utils::message::WsMessage;
use serde_json::json;
use tokio::time::Instant;

const STREAM_CHUNKS: [&str; 3] = [
    "正在分析图像...",
    "检测到这是一个室内场景。",
    "可以看到一张桌子和一把椅子。",
];
const FINAL_TEXT: &str = "这是一个室内办公环境，中央有一张木质桌子，旁边摆放着一把黑色转椅。墙上挂着一幅抽象画，光线从窗户照射进来。";
const FRAME_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SimulatedBackend {
    response_delay: Duration,
    scheduled: Vec<(Instant, WsMessage)>,
}

impl SimulatedBackend {
    pub fn new(response_delay: Duration) -> Self {
        Self {
            response_delay,
            scheduled: Vec::new(),
        }
    }

    /// 为一次图像分析排出应答帧。最终结果帧携带请求的 `messageId`，以便关联等待中的请求。
    pub fn schedule_analysis(&mut self, now: Instant, session_id: &str, message_id: Option<String>) {
        let start = now + self.response_delay;
        for (i, chunk) in STREAM_CHUNKS.iter().enumerate() {
            let frame = WsMessage::from_value(
                TEXT_STREAM_EVENT,
                json!({ "content": chunk, "is_final": false, "sessionId": session_id }),
            )
            .with_session_id(session_id);
            self.scheduled.push((start + FRAME_SPACING * i as u32, frame));
        }
        let mut last = WsMessage::from_value(FINAL_RESULT_EVENT, json!({ "text": FINAL_TEXT, "sessionId": session_id }))
            .with_session_id(session_id);
        last.message_id = message_id;
        self.scheduled
            .push((start + FRAME_SPACING * STREAM_CHUNKS.len() as u32, last));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(at, _)| *at).min()
    }

    /// 取出所有已到期的帧，按预定时间排序。
    pub fn due(&mut self, now: Instant) -> Vec<WsMessage> {
        let (mut ready, waiting): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|(at, _)| *at <= now);
        self.scheduled = waiting;
        ready.sort_by_key(|(at, _)| *at);
        ready.into_iter().map(|(_, frame)| frame).collect()
    }

    /// 取消全部未投递的帧，返回个数。
    pub fn cancel_all(&mut self) -> usize {
        let count = self.scheduled.len();
        self.scheduled.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }
}
