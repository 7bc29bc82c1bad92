// comm_client/src/ws_client/service.rs

//! 连接管理器。
//!
//! `ConnectionManager` 是对外的句柄，可以任意克隆并交给各个消费方。所有可变状态
//! （连接、出站队列、心跳、重连计数、等待中的请求、配置）都由一个后台任务 `ManagerCore` 独占，
//! 它一次只处理一个输入：API 命令、连接结果、连接事件或计时器到期。
//! 因此任意两个操作都不会交错，也就不需要在状态机内部加锁。
//!
//! 所有计时器都表示为 `ManagerCore` 持有的截止时间（`tokio::time::Instant`），主循环每轮
//! 只睡到最近的一个截止时间。测试中暂停 tokio 时钟并手动推进，即可精确驱动重连、心跳与超时。
//!
//! 对外只暴露只读快照，三者都来自 `watch` 通道：连接状态在变化时立即发布，统计与配置在
//! 每轮处理结束时以及每次回复调用方之前发布，调用方在 `await` 返回后读到的一定不早于这次调用。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common_models::enums::{ConnectionState, InboundEventType};
use common_models::ws_payloads::{
    AnalyzeRequest, HeartbeatPayload, ImageAnalysisPayload, HEARTBEAT_EVENT, IMAGE_ANALYSIS_EVENT,
};
use log::{debug, error, info, warn};
use rust_websocket_utils::message::WsMessage;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::backoff::ReconnectController;
use super::dispatcher::{self, Inbound};
use super::heartbeat::HeartbeatMonitor;
use super::pending::{PendingRequests, ReplySender};
use super::queue::OutboundQueue;
use super::runtime::{PatchDecision, RuntimeConfigController};
use super::simulated::SimulatedBackend;
use super::stats::Stats;
use super::transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};
use crate::api_client::HttpApiClient;
use crate::config::{ConnectionConfig, RuntimeConfigPatch};
use crate::error::CommError;
use crate::event::{CommCommand, CommEvent, EventBus, ReceivedMessage};

/// `stop()` 拒绝等待中请求时使用的原因。
pub const MODULE_STOPPED_REASON: &str = "通信模块已停止";
const SWITCHED_TO_SIMULATED_REASON: &str = "已切换到模拟后端，连接中断";
const SWITCHED_TO_LIVE_REASON: &str = "已切换到真实服务器，连接重建中";

/// 连接管理器内部状态的诊断快照。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSnapshot {
    pub state: ConnectionState,
    /// 是否处于运行中（`start` 之后、`stop` 之前，且未被触发开关暂停）。
    pub active: bool,
    pub reconnect_attempts: u32,
    pub queue_len: usize,
    pub pending_requests: usize,
    /// 挂起的计时器总数：连接超时、重连、心跳、请求超时与模拟应答。
    pub active_timers: usize,
    pub client_id: Option<String>,
    pub simulated: bool,
}

enum ManagerCommand {
    Start(oneshot::Sender<bool>),
    Stop(oneshot::Sender<()>),
    Send(WsMessage),
    Request {
        message: WsMessage,
        timeout: Duration,
        reply: ReplySender,
    },
    ManualReconnect(oneshot::Sender<Result<(), CommError>>),
    UpdateConfig {
        patch: RuntimeConfigPatch,
        reply: Option<oneshot::Sender<Result<(), CommError>>>,
    },
    TriggerEnabled(bool),
    CaptureCompleted {
        image_data: String,
        session_id: String,
    },
    SimulateAnalysis {
        session_id: String,
    },
    ResetStats,
    Snapshot(oneshot::Sender<ManagerSnapshot>),
}

impl From<CommCommand> for ManagerCommand {
    fn from(command: CommCommand) -> Self {
        match command {
            CommCommand::CaptureCompleted { image_data, session_id } => {
                ManagerCommand::CaptureCompleted { image_data, session_id }
            }
            CommCommand::TriggerEnabledChanged(enabled) => ManagerCommand::TriggerEnabled(enabled),
            CommCommand::ConfigPatch(patch) => ManagerCommand::UpdateConfig { patch, reply: None },
        }
    }
}

/// 连接管理器句柄。
///
/// 每个实例拥有独立的后台任务与状态，实例之间互不影响。全部句柄被释放后后台任务清理连接并退出。
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<ManagerCommand>,
    state: watch::Receiver<ConnectionState>,
    stats: watch::Receiver<Stats>,
    config: watch::Receiver<ConnectionConfig>,
    bus: EventBus,
    http: HttpApiClient,
}

impl std::fmt::Debug for ManagerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ManagerCommand::Start(_) => "Start",
            ManagerCommand::Stop(_) => "Stop",
            ManagerCommand::Send(_) => "Send",
            ManagerCommand::Request { .. } => "Request",
            ManagerCommand::ManualReconnect(_) => "ManualReconnect",
            ManagerCommand::UpdateConfig { .. } => "UpdateConfig",
            ManagerCommand::TriggerEnabled(_) => "TriggerEnabled",
            ManagerCommand::CaptureCompleted { .. } => "CaptureCompleted",
            ManagerCommand::SimulateAnalysis { .. } => "SimulateAnalysis",
            ManagerCommand::ResetStats => "ResetStats",
            ManagerCommand::Snapshot(_) => "Snapshot",
        };
        f.write_str(name)
    }
}

impl ConnectionManager {
    /// 创建连接管理器并启动其后台任务。必须在 tokio 运行时中调用。
    ///
    /// 配置先规范化并校验，非法时返回 `CommError::Config`。创建后处于 `Disconnected`，
    /// 需要调用 `start` 才会开始连接。事件通道上的命令会被转发给这个实例。
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>, bus: EventBus) -> Result<Self, CommError> {
        let mut config = config;
        config.server = config.server.normalized()?;
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, stats_rx) = watch::channel(Stats::default());
        let (config_tx, config_rx) = watch::channel(config.clone());

        let core = ManagerCore::new(config, transport, bus.clone(), state_tx, stats_tx, config_tx);
        tokio::spawn(core.run(command_rx));
        spawn_command_forwarder(&bus, command_tx.downgrade());

        info!("[通信模块] 连接管理器已创建。");
        Ok(Self {
            commands: command_tx,
            state: state_rx,
            stats: stats_rx,
            config: config_rx,
            bus,
            http: HttpApiClient::new(),
        })
    }

    /// 使用真实 WebSocket 传输创建连接管理器。
    pub fn with_websocket(config: ConnectionConfig, bus: EventBus) -> Result<Self, CommError> {
        Self::new(config, Arc::new(WebSocketTransport), bus)
    }

    fn dispatch(&self, command: ManagerCommand) -> Result<(), CommError> {
        self.commands.send(command).map_err(|e| {
            error!("[通信模块] 后台任务已结束，命令 {:?} 无法处理。", e.0);
            CommError::NotRunning
        })
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T, CommError> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(build(tx))?;
        rx.await.map_err(|_| CommError::NotRunning)
    }

    /// 启动模块。已在运行时直接返回 `true`；后台任务已结束时返回 `false`。
    pub async fn start(&self) -> bool {
        self.call(ManagerCommand::Start).await.unwrap_or(false)
    }

    /// 停止模块：断开连接、取消全部计时器、清空出站队列并拒绝全部等待中的请求。任何状态下都可调用。
    pub async fn stop(&self) {
        let _ = self.call(ManagerCommand::Stop).await;
    }

    /// 发送一条消息，不等待结果。
    ///
    /// 已连接时立即写出，否则进入出站队列（满时丢弃最早的一条）。`payload` 中的
    /// `sessionId` 会同时写入信封。
    pub fn send(&self, event_type: impl Into<String>, payload: Value) {
        let session_id = payload.get("sessionId").and_then(Value::as_str).map(str::to_string);
        let mut message = WsMessage::from_value(event_type, payload);
        message.session_id = session_id;
        self.send_message(message);
    }

    pub fn send_message(&self, message: WsMessage) {
        let _ = self.dispatch(ManagerCommand::Send(message));
    }

    /// 发送一条请求并等待携带相同 `messageId` 的响应。
    pub async fn request(
        &self,
        event_type: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<WsMessage, CommError> {
        let message = WsMessage::from_value(event_type, payload).with_message_id(WsMessage::new_message_id());
        self.call(|reply| ManagerCommand::Request {
            message,
            timeout,
            reply,
        })
        .await?
    }

    /// 手动重连：重连计数清零，断开现有连接后立即重新连接。
    ///
    /// 连接成功（收到服务端握手确认）后返回 `Ok`；本次尝试失败时返回错误，
    /// 之后状态机按正常流程继续自动重连。模拟模式下直接返回 `Ok`。
    pub async fn manual_reconnect(&self) -> Result<(), CommError> {
        self.call(ManagerCommand::ManualReconnect).await?
    }

    /// 应用运行时配置补丁。合并后的配置非法时返回 `CommError::Config`，配置保持不变；
    /// 与上一次已生效的补丁相同时不产生任何副作用。返回后 `get_config` 即可读到新配置。
    pub async fn update_config(&self, patch: RuntimeConfigPatch) -> Result<(), CommError> {
        self.call(|reply| ManagerCommand::UpdateConfig {
            patch,
            reply: Some(reply),
        })
        .await?
    }

    /// 触发开关变化：关闭时暂停连接（保留出站队列），开启时恢复。
    pub fn set_trigger_enabled(&self, enabled: bool) {
        let _ = self.dispatch(ManagerCommand::TriggerEnabled(enabled));
    }

    /// 采集完成：构造 `image_analysis` 消息并交给发送管线。
    pub fn capture_completed(&self, image_data: String, session_id: String) {
        let _ = self.dispatch(ManagerCommand::CaptureCompleted { image_data, session_id });
    }

    /// 直接处理一条事件通道命令，与经由 `EventBus::dispatch` 投递等价。
    pub fn handle_command(&self, command: CommCommand) {
        let _ = self.dispatch(command.into());
    }

    pub fn get_connection_status(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 订阅连接状态变化。
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn get_stats(&self) -> Stats {
        self.stats.borrow().clone()
    }

    pub fn reset_stats(&self) {
        let _ = self.dispatch(ManagerCommand::ResetStats);
    }

    /// 当前配置的只读副本。
    pub async fn get_config(&self) -> ConnectionConfig {
        self.config.borrow().clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot, CommError> {
        self.call(ManagerCommand::Snapshot).await
    }

    /// HTTP 健康检查。模拟模式下总是返回 `true`。
    pub async fn test_connection(&self) -> bool {
        let config = self.get_config().await;
        if config.use_simulated_backend {
            return true;
        }
        match self.http.health(&config).await {
            Ok(health) => {
                info!("[通信模块] 健康检查结果: {}", health.status);
                health.is_healthy()
            }
            Err(e) => {
                warn!("[通信模块] 健康检查失败: {}", e);
                false
            }
        }
    }

    /// 通过 HTTP 备用通道提交一次图像分析。
    ///
    /// 成功时返回服务端文本，并作为一条 `text_result` 消息发布。模拟模式下改由模拟后端应答，返回 `Ok(None)`。
    pub async fn send_image_via_http(&self, image_data: String, session_id: String) -> Result<Option<String>, CommError> {
        let config = self.get_config().await;
        if config.use_simulated_backend {
            self.dispatch(ManagerCommand::SimulateAnalysis { session_id })?;
            return Ok(None);
        }
        let request = AnalyzeRequest {
            image_data,
            session_id: session_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };
        match self.http.analyze(&config, &request).await {
            Ok(text) => {
                self.bus.publish(CommEvent::MessageReceived(ReceivedMessage {
                    event_type: InboundEventType::TextResult,
                    session_id: Some(session_id.clone()),
                    text: Some(text.clone()),
                    is_final: false,
                    data: json!({ "text": text, "sessionId": session_id }),
                }));
                Ok(Some(text))
            }
            Err(e) => {
                self.bus.publish(CommEvent::SendError {
                    event_type: IMAGE_ANALYSIS_EVENT.to_string(),
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }
}

/// 把事件通道上的命令转发给后台任务。只持有弱引用，不会阻止后台任务退出。
fn spawn_command_forwarder(bus: &EventBus, commands: mpsc::WeakUnboundedSender<ManagerCommand>) {
    let mut bus_commands = bus.command_receiver();
    tokio::spawn(async move {
        loop {
            match bus_commands.recv().await {
                Ok(command) => {
                    let Some(commands) = commands.upgrade() else { break };
                    if commands.send(command.into()).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[通信模块] 命令处理落后，跳过了 {} 条事件通道命令。", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("[通信模块] 事件通道命令转发已结束。");
    });
}

struct ConnectOutcome {
    generation: u64,
    result: Result<TransportLink, CommError>,
}

async fn next_link_event(link: &mut Option<TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

/// 后台任务持有的全部状态。
struct ManagerCore {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    bus: EventBus,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    stats: Stats,
    stats_tx: watch::Sender<Stats>,
    config_tx: watch::Sender<ConnectionConfig>,

    active: bool,
    link: Option<TransportLink>,
    client_id: Option<String>,
    generation: u64,
    connect_task: Option<JoinHandle<()>>,
    outcome_tx: mpsc::UnboundedSender<ConnectOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ConnectOutcome>,
    manual_waiters: Vec<oneshot::Sender<Result<(), CommError>>>,

    connect_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    reconnect: ReconnectController,
    heartbeat: HeartbeatMonitor,
    queue: OutboundQueue,
    pending: PendingRequests,
    runtime: RuntimeConfigController,
    simulated: SimulatedBackend,
}

impl ManagerCore {
    fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        bus: EventBus,
        state_tx: watch::Sender<ConnectionState>,
        stats_tx: watch::Sender<Stats>,
        config_tx: watch::Sender<ConnectionConfig>,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            reconnect: ReconnectController::new(&config.reconnect),
            heartbeat: HeartbeatMonitor::new(Duration::from_millis(config.heartbeat.interval_ms)),
            queue: OutboundQueue::new(config.queue.capacity),
            pending: PendingRequests::new(),
            runtime: RuntimeConfigController::new(),
            simulated: SimulatedBackend::new(Duration::from_millis(config.simulated_response_delay_ms)),
            config,
            transport,
            bus,
            state: ConnectionState::Disconnected,
            state_tx,
            stats: Stats::default(),
            stats_tx,
            config_tx,
            active: false,
            link: None,
            client_id: None,
            generation: 0,
            connect_task: None,
            outcome_tx,
            outcome_rx,
            manual_waiters: Vec::new(),
            connect_deadline: None,
            reconnect_deadline: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ManagerCommand>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("[通信模块] 所有句柄均已释放，后台任务退出。");
                        self.stop();
                        break;
                    }
                },
                Some(outcome) = self.outcome_rx.recv() => self.handle_connect_outcome(outcome),
                event = next_link_event(&mut self.link) => self.handle_link_event(event),
                _ = sleep_until_deadline(deadline) => self.on_timers(Instant::now()),
            }
            self.publish_shared();
        }
    }

    /// 把统计与配置发布到只读副本。
    fn publish_shared(&self) {
        self.stats_tx.send_if_modified(|shared| {
            if *shared == self.stats {
                return false;
            }
            *shared = self.stats.clone();
            true
        });
        self.config_tx.send_if_modified(|shared| {
            if *shared == self.config {
                return false;
            }
            *shared = self.config.clone();
            true
        });
    }

    /// 先发布只读副本再回复调用方。
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish_shared();
        let _ = reply.send(value);
    }

    fn next_deadline(&self) -> Option<Instant> {
        earliest([
            self.connect_deadline,
            self.reconnect_deadline,
            self.heartbeat.next_deadline(),
            self.pending.next_deadline(),
            self.simulated.next_deadline(),
        ])
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Start(reply) => {
                let started = self.start();
                self.reply(reply, started);
            }
            ManagerCommand::Stop(reply) => {
                self.stop();
                self.reply(reply, ());
            }
            ManagerCommand::Send(message) => {
                self.send(message);
            }
            ManagerCommand::Request { message, timeout, reply } => self.request(message, timeout, reply),
            ManagerCommand::ManualReconnect(reply) => self.manual_reconnect(reply),
            ManagerCommand::UpdateConfig { patch, reply } => {
                let result = self.apply_patch(&patch);
                if let Err(e) = &result {
                    warn!("[通信模块] 配置补丁被拒绝: {}", e);
                    self.bus.publish(CommEvent::Error(e.clone()));
                }
                if let Some(reply) = reply {
                    self.reply(reply, result);
                }
            }
            ManagerCommand::TriggerEnabled(enabled) => self.set_trigger_enabled(enabled),
            ManagerCommand::CaptureCompleted { image_data, session_id } => self.capture_completed(image_data, session_id),
            ManagerCommand::SimulateAnalysis { session_id } => {
                if self.state == ConnectionState::Offline {
                    self.simulated.schedule_analysis(Instant::now(), &session_id, None);
                } else {
                    warn!("[通信模块] 当前不在模拟模式，忽略模拟分析请求 (会话: {})。", session_id);
                }
            }
            ManagerCommand::ResetStats => self.stats = Stats::default(),
            ManagerCommand::Snapshot(reply) => {
                let snapshot = self.snapshot();
                self.reply(reply, snapshot);
            }
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let active_timers = usize::from(self.connect_deadline.is_some())
            + usize::from(self.reconnect_deadline.is_some())
            + self.heartbeat.active_timers()
            + self.pending.len()
            + self.simulated.pending();
        ManagerSnapshot {
            state: self.state,
            active: self.active,
            reconnect_attempts: self.reconnect.attempts(),
            queue_len: self.queue.len(),
            pending_requests: self.pending.len(),
            active_timers,
            client_id: self.client_id.clone(),
            simulated: self.config.use_simulated_backend,
        }
    }

    // --- 生命周期 ---

    fn start(&mut self) -> bool {
        if self.active {
            debug!("[通信模块] 模块已在运行，忽略重复的启动请求。");
            return true;
        }
        info!("[通信模块] 正在启动...");
        self.active = true;
        self.bus.publish(CommEvent::ModuleStarted);
        self.activate();
        true
    }

    /// 按当前模式进入工作状态：模拟模式进入 `Offline`，否则开始连接。
    fn activate(&mut self) {
        self.reconnect.reset();
        if self.config.use_simulated_backend {
            self.set_state(ConnectionState::Offline);
            self.flush_queue();
        } else {
            self.begin_connect();
        }
    }

    fn stop(&mut self) {
        let was_active = self.active;
        self.active = false;
        self.reconnect_deadline = None;
        self.teardown_link();
        self.simulated.cancel_all();
        let dropped = self.queue.clear();
        self.publish_shared();
        let rejected = self.pending.reject_all(MODULE_STOPPED_REASON);
        self.fail_manual_waiters(&CommError::RequestRejected(MODULE_STOPPED_REASON.to_string()));
        self.reconnect.reset();
        self.set_state(ConnectionState::Disconnected);
        if was_active {
            info!(
                "[通信模块] 已停止。丢弃出站消息 {} 条，拒绝等待中的请求 {} 个。",
                dropped, rejected
            );
            self.bus.publish(CommEvent::ModuleStopped);
        }
    }

    fn set_trigger_enabled(&mut self, enabled: bool) {
        if enabled {
            if self.active {
                return;
            }
            info!("[通信模块] 触发已开启，恢复连接。");
            self.active = true;
            self.activate();
        } else {
            if !self.active {
                return;
            }
            info!("[通信模块] 触发已关闭，暂停连接（保留出站队列）。");
            self.active = false;
            self.reconnect_deadline = None;
            self.teardown_link();
            self.simulated.cancel_all();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // --- 连接建立 ---

    /// 断开现有连接（如有）并发起新的连接尝试。
    fn begin_connect(&mut self) {
        self.teardown_link();
        self.reconnect_deadline = None;
        self.generation += 1;

        let url = match self.config.connect_url(Utc::now().timestamp_millis()) {
            Ok(url) => url,
            Err(e) => {
                let err = CommError::from(e);
                error!("[通信模块] 无法生成连接地址: {}", err);
                self.bus.publish(CommEvent::Error(err.clone()));
                self.fail_manual_waiters(&err);
                self.set_state(ConnectionState::Error);
                return;
            }
        };

        self.set_state(ConnectionState::Connecting);
        self.connect_deadline = Some(Instant::now() + Duration::from_millis(self.config.reconnect.timeout_ms));
        info!("[通信模块] 正在连接 {} (第 {} 代)", url, self.generation);

        let generation = self.generation;
        let transport = self.transport.clone();
        let outcome_tx = self.outcome_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = transport.connect(url).await;
            let _ = outcome_tx.send(ConnectOutcome { generation, result });
        }));
    }

    fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.generation != self.generation || self.state != ConnectionState::Connecting {
            debug!("[通信模块] 丢弃过期的连接结果 (第 {} 代)。", outcome.generation);
            return;
        }
        self.connect_task = None;
        match outcome.result {
            Ok(link) => {
                self.link = Some(link);
                if self.config.reconnect.require_peer_ack {
                    debug!("[通信模块] 连接已打开，等待服务端握手确认。");
                } else {
                    self.on_peer_ack(None, None);
                }
            }
            Err(e) => {
                warn!("[通信模块] 连接失败: {}", e);
                self.on_connect_failure(e);
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        let timeout_ms = self.config.reconnect.timeout_ms;
        warn!("[通信模块] 连接在 {}ms 内未完成，强制关闭。", timeout_ms);
        self.on_connect_failure(CommError::Timeout(format!("连接在 {}ms 内未完成", timeout_ms)));
    }

    fn on_connect_failure(&mut self, err: CommError) {
        self.teardown_link();
        self.bus.publish(CommEvent::Error(err.clone()));
        self.fail_manual_waiters(&err);
        self.schedule_reconnect_or_fail();
    }

    fn schedule_reconnect_or_fail(&mut self) {
        if !self.active {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        if !self.config.reconnect.enabled {
            self.set_state(ConnectionState::Error);
            return;
        }
        match self.reconnect.next_attempt() {
            Some((attempt, delay)) => {
                info!(
                    "[通信模块] {}ms 后进行第 {}/{} 次重连。",
                    delay.as_millis(),
                    attempt,
                    self.reconnect.max_attempts()
                );
                self.set_state(ConnectionState::Reconnecting);
                self.reconnect_deadline = Some(Instant::now() + delay);
            }
            None => {
                let attempts = self.reconnect.attempts();
                let max = self.reconnect.max_attempts();
                error!("[通信模块] 已达到最大重连次数 ({}/{})，停止自动重连。", attempts, max);
                self.set_state(ConnectionState::Error);
                self.bus.publish(CommEvent::MaxAttemptsExceeded { attempts, max });
                self.bus.publish(CommEvent::Error(CommError::MaxAttemptsExceeded { attempts, max }));
            }
        }
    }

    fn on_peer_ack(&mut self, client_id: Option<String>, message: Option<String>) {
        if self.state != ConnectionState::Connecting || self.link.is_none() {
            debug!("[通信模块] 非握手阶段收到 connected 消息，已忽略。");
            return;
        }
        self.connect_deadline = None;
        self.reconnect.reset();
        self.client_id = client_id.clone();
        self.stats.mark_connected(Utc::now());
        self.set_state(ConnectionState::Connected);
        info!("[通信模块] 已连接 (客户端 ID: {:?})", client_id);
        self.bus.publish(CommEvent::Connected { client_id, message });
        self.flush_queue();
        self.publish_shared();
        for waiter in self.manual_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_link_lost(&mut self, reason: String) {
        match self.state {
            ConnectionState::Connecting => self.on_connect_failure(CommError::Connection(reason)),
            ConnectionState::Connected => {
                warn!("[通信模块] 连接已断开: {}", reason);
                self.teardown_link();
                self.set_state(ConnectionState::Disconnected);
                self.bus.publish(CommEvent::Error(CommError::Connection(reason)));
                if self.active && self.config.reconnect.enabled {
                    self.schedule_reconnect_or_fail();
                }
            }
            _ => self.teardown_link(),
        }
    }

    /// 释放连接及与之相关的计时器。不改变状态。
    fn teardown_link(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if self.link.take().is_some() {
            debug!("[通信模块] 已释放当前连接。");
        }
        self.connect_deadline = None;
        self.client_id = None;
        self.heartbeat.stop();
    }

    fn fail_manual_waiters(&mut self, err: &CommError) {
        if self.manual_waiters.is_empty() {
            return;
        }
        self.publish_shared();
        for waiter in self.manual_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn manual_reconnect(&mut self, reply: oneshot::Sender<Result<(), CommError>>) {
        if self.config.use_simulated_backend {
            self.active = true;
            if self.state != ConnectionState::Offline {
                self.set_state(ConnectionState::Offline);
                self.flush_queue();
            }
            self.reply(reply, Ok(()));
            return;
        }
        info!("[通信模块] 手动重连，重连计数清零。");
        self.active = true;
        self.reconnect.reset();
        self.manual_waiters.push(reply);
        self.begin_connect();
    }

    // --- 计时器 ---

    fn on_timers(&mut self, now: Instant) {
        if self.connect_deadline.is_some_and(|d| d <= now) {
            self.connect_deadline = None;
            self.on_connect_timeout();
        }
        if self.reconnect_deadline.is_some_and(|d| d <= now) {
            self.reconnect_deadline = None;
            self.begin_connect();
        }
        if self.heartbeat.next_probe().is_some_and(|d| d <= now) {
            self.send_heartbeat(now);
        }
        if let Some(silent) = self.heartbeat.check_silence(now) {
            self.bus.publish(CommEvent::HeartbeatTimeout {
                silent_ms: silent.as_millis() as u64,
            });
        }
        self.publish_shared();
        let expired = self.pending.expire(now);
        if expired > 0 {
            warn!("[通信模块] {} 个请求等待响应超时。", expired);
        }
        for frame in self.simulated.due(now) {
            let bytes = frame.to_json_string().map(|text| text.len()).unwrap_or_default();
            self.handle_inbound_message(frame, bytes);
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        self.heartbeat.on_probe_sent(now);
        let probe = WsMessage::new(
            HEARTBEAT_EVENT,
            &HeartbeatPayload {
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        match probe.map_err(CommError::from).and_then(|probe| self.transmit(&probe)) {
            Ok(()) => debug!("[心跳监视器] 已发送心跳探测。"),
            Err(e) => warn!("[心跳监视器] 发送心跳探测失败: {}", e),
        }
    }

    // --- 入站 ---

    fn handle_link_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(text)) => self.handle_frame(text),
            Some(TransportEvent::Closed { reason }) => {
                self.on_link_lost(reason.unwrap_or_else(|| "服务器关闭了连接".to_string()))
            }
            Some(TransportEvent::Failed(reason)) => self.on_link_lost(reason),
            None => self.on_link_lost("连接通道已关闭".to_string()),
        }
    }

    fn handle_frame(&mut self, text: String) {
        debug!("[通信模块] 收到帧: {}", text);
        match WsMessage::from_json_str(&text) {
            Ok(message) => self.handle_inbound_message(message, text.len()),
            Err(e) => {
                let err = CommError::from(e);
                error!("[通信模块] 丢弃无法解析的帧: {}", err);
                self.bus.publish(CommEvent::Error(err));
            }
        }
    }

    fn handle_inbound_message(&mut self, message: WsMessage, bytes: usize) {
        self.stats
            .record_received(bytes, Utc::now(), message.timestamp_millis());
        if let Some(message_id) = message.message_id.as_deref() {
            self.publish_shared();
            self.pending.resolve(message_id, message.clone());
        }
        match dispatcher::classify(&message) {
            Ok(Inbound::PeerAck { client_id, message }) => self.on_peer_ack(client_id, message),
            Ok(Inbound::HeartbeatAck) => {
                if self.heartbeat.on_ack(Instant::now()) {
                    info!("[心跳监视器] 已重新收到心跳应答。");
                    self.bus.publish(CommEvent::HeartbeatRecovered);
                }
            }
            Ok(Inbound::Notify(events)) => {
                for event in events {
                    self.bus.publish(event);
                }
            }
            Ok(Inbound::Unknown(event_type)) => {
                warn!("[通信模块] 未知的消息类型 '{}'，已丢弃。", event_type);
            }
            Err(e) => {
                error!("[通信模块] 消息 '{}' 的数据无法解析: {}", message.event_type, e);
                self.bus.publish(CommEvent::Error(e));
            }
        }
    }

    // --- 出站 ---

    /// 写出一帧并计入统计。
    fn transmit(&mut self, message: &WsMessage) -> Result<(), CommError> {
        let text = message.to_json_string()?;
        let bytes = text.len();
        self.link
            .as_ref()
            .ok_or_else(|| CommError::Connection("连接尚未建立".to_string()))?
            .send(text)?;
        self.stats.record_sent(bytes);
        debug!("[通信模块] 已发送 '{}' ({} 字节)", message.event_type, bytes);
        Ok(())
    }

    fn enqueue(&mut self, message: WsMessage) {
        debug!("[通信模块] 当前状态 {}，'{}' 进入出站队列。", self.state, message.event_type);
        if let Some(evicted) = self.queue.push(message) {
            warn!("[通信模块] 出站队列已满，丢弃最早的消息 '{}'。", evicted.event_type);
        }
    }

    /// 发送一条消息。返回 `true` 表示已立即交付（写出或交给模拟后端），`false` 表示进入了队列。
    fn send(&mut self, message: WsMessage) -> bool {
        match self.state {
            ConnectionState::Connected => match self.transmit(&message) {
                Ok(()) => true,
                Err(e) => {
                    warn!("[通信模块] 写出 '{}' 失败，放回出站队列: {}", message.event_type, e);
                    let event_type = message.event_type.clone();
                    self.enqueue(message);
                    self.bus.publish(CommEvent::SendError { event_type, error: e });
                    false
                }
            },
            ConnectionState::Offline => {
                self.simulate(message);
                true
            }
            _ => {
                self.enqueue(message);
                false
            }
        }
    }

    fn simulate(&mut self, message: WsMessage) {
        if message.event_type != IMAGE_ANALYSIS_EVENT {
            debug!("[通信模块] 模拟后端不处理 '{}'。", message.event_type);
            return;
        }
        let session_id = message
            .session_id
            .clone()
            .or_else(|| message.data.get("sessionId").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_default();
        let bytes = message.to_json_string().map(|text| text.len()).unwrap_or_default();
        self.stats.record_sent(bytes);
        info!("[通信模块] 图像分析请求 (会话: {}) 交给模拟后端。", session_id);
        self.simulated
            .schedule_analysis(Instant::now(), &session_id, message.message_id.clone());
    }

    /// 按插入顺序补发出站队列。写出失败的消息放回队首，等待下一次连接。
    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        info!("[通信模块] 补发出站队列中的 {} 条消息。", self.queue.len());
        while self.state.can_deliver() {
            let Some(message) = self.queue.pop_front() else { break };
            if self.state == ConnectionState::Offline {
                self.simulate(message);
                continue;
            }
            if let Err(e) = self.transmit(&message) {
                warn!("[通信模块] 补发 '{}' 失败: {}", message.event_type, e);
                let event_type = message.event_type.clone();
                self.queue.push_front(message);
                self.bus.publish(CommEvent::SendError { event_type, error: e });
                break;
            }
        }
    }

    fn request(&mut self, message: WsMessage, timeout: Duration, reply: ReplySender) {
        let message_id = message
            .message_id
            .clone()
            .unwrap_or_else(WsMessage::new_message_id);
        let message = message.with_message_id(message_id.clone());
        self.pending
            .insert(message_id, message.event_type.clone(), Instant::now() + timeout, reply);
        self.send(message);
    }

    fn capture_completed(&mut self, image_data: String, session_id: String) {
        let payload = ImageAnalysisPayload::base64(
            image_data,
            session_id.clone(),
            Utc::now().timestamp_millis(),
            self.config.compression.enable,
        );
        let message = match WsMessage::new(IMAGE_ANALYSIS_EVENT, &payload) {
            Ok(message) => message.with_session_id(session_id.clone()),
            Err(e) => {
                let err = CommError::from(e);
                error!("[通信模块] 构造图像分析消息失败: {}", err);
                self.bus.publish(CommEvent::SendError {
                    event_type: IMAGE_ANALYSIS_EVENT.to_string(),
                    error: err,
                });
                return;
            }
        };
        let delivered = self.send(message);
        self.bus.publish(CommEvent::ImageSent {
            session_id,
            queued: !delivered,
        });
    }

    // --- 运行时配置 ---

    fn apply_patch(&mut self, patch: &RuntimeConfigPatch) -> Result<(), CommError> {
        let normalized = match self.runtime.begin(patch) {
            PatchDecision::Apply(normalized) => normalized,
            PatchDecision::Duplicate | PatchDecision::Busy | PatchDecision::Empty => return Ok(()),
        };
        let plan = match self.runtime.plan(&normalized, &self.config) {
            Ok(plan) => plan,
            Err(e) => {
                self.runtime.finish(None);
                return Err(e.into());
            }
        };
        if plan.is_noop() {
            debug!("[通信模块] 配置补丁与当前配置一致，无需改动。");
            self.runtime.finish(Some(normalized));
            return Ok(());
        }

        let changes_config = plan.changes_config();
        let address_changed = plan.server.is_some();
        if let Some(server) = plan.server {
            info!("[通信模块] 服务器地址已更新: {} / {}", server.ws_url, server.http_url);
            self.config.server = server;
        }
        if let Some(reconnect) = plan.reconnect {
            info!(
                "[通信模块] 重连参数已更新: 最多 {} 次，基础间隔 {}ms，上限 {}ms。",
                reconnect.max_attempts, reconnect.base_interval_ms, reconnect.cap_ms
            );
            self.reconnect.reconfigure(&reconnect);
            let disabled = !reconnect.enabled;
            self.config.reconnect = reconnect;
            if disabled && self.state == ConnectionState::Reconnecting {
                info!("[通信模块] 自动重连已关闭，取消等待中的重连。");
                self.reconnect_deadline = None;
                self.set_state(ConnectionState::Error);
            }
        }
        if let Some(heartbeat) = plan.heartbeat {
            info!("[心跳监视器] 心跳周期调整为 {}ms。", heartbeat.interval_ms);
            self.heartbeat
                .set_interval(Duration::from_millis(heartbeat.interval_ms), Instant::now());
            self.config.heartbeat = heartbeat;
        }
        if let Some(http) = plan.http {
            debug!("[通信模块] HTTP 参数已更新: {:?}", http);
            self.config.http = http;
        }
        if changes_config {
            self.bus.publish(CommEvent::ConfigUpdated(Box::new(self.config.clone())));
        }

        match plan.simulated {
            Some(simulated) => self.switch_mode(simulated),
            None if address_changed
                && self.active
                && matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) =>
            {
                info!("[通信模块] 使用新地址重建连接。");
                self.reconnect.reset();
                self.begin_connect();
            }
            None => {}
        }
        self.runtime.finish(Some(normalized));
        Ok(())
    }

    /// 在真实服务器与模拟后端之间切换。
    ///
    /// 顺序固定：标记为未运行、取消计时器、清空出站队列、拒绝等待中的请求，
    /// 然后进入 `Offline` 或重新连接。切换前是否在运行都一样，切换本身会让模块进入运行。
    fn switch_mode(&mut self, simulated: bool) {
        let reason = if simulated {
            SWITCHED_TO_SIMULATED_REASON
        } else {
            SWITCHED_TO_LIVE_REASON
        };
        info!("[通信模块] {}", reason);

        self.active = false;
        self.reconnect_deadline = None;
        self.teardown_link();
        self.simulated.cancel_all();
        let dropped = self.queue.clear();
        self.config.use_simulated_backend = simulated;
        self.publish_shared();
        let rejected = self.pending.reject_all(reason);
        self.fail_manual_waiters(&CommError::RequestRejected(reason.to_string()));
        debug!("[通信模块] 模式切换丢弃出站消息 {} 条，拒绝请求 {} 个。", dropped, rejected);

        self.bus.publish(CommEvent::ModeSwitched { simulated });
        self.active = true;
        self.activate();
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        let previous = self.state;
        self.state = next;
        if previous == ConnectionState::Connected {
            self.heartbeat.stop();
        }
        if next == ConnectionState::Connected {
            self.heartbeat.start(Instant::now());
        }
        info!("[通信模块] 连接状态: {} -> {}", previous, next);
        self.state_tx.send_replace(next);
        self.bus.publish(CommEvent::ConnectionStateChanged {
            previous,
            current: next,
        });
    }
}
