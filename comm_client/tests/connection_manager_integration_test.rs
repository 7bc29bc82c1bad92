// comm_client/tests/connection_manager_integration_test.rs

//! 通过真实的 WebSocket 连接驱动连接管理器，对端由 `rust_websocket_utils` 的测试服务器扮演。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use comm_client::config::ConnectionConfig;
use comm_client::event::{CommEvent, EventBus, EventTopic};
use comm_client::ConnectionManager;
use common_models::enums::ConnectionState;
use common_models::ws_payloads::{
    ConnectedData, CONNECTED_EVENT, FINAL_RESULT_EVENT, HEARTBEAT_EVENT, IMAGE_ANALYSIS_EVENT, PONG_EVENT,
    TEXT_STREAM_EVENT,
};
use log::{info, LevelFilter};
use rust_websocket_utils::message::WsMessage;
use rust_websocket_utils::server::transport::{receive_message, ConnectionHandler, ServerWsReceiver, WsServer};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::Info).is_test(true).try_init();
}

fn config_for(addr: std::net::SocketAddr) -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    config.server.ws_url = format!("ws://{}/ws", addr);
    config.server.http_url = format!("http://{}", addr);
    config.reconnect.base_interval_ms = 100;
    config.reconnect.cap_ms = 1000;
    config.reconnect.timeout_ms = 2000;
    config.heartbeat.interval_ms = 200;
    config
}

async fn send_connected(handler: &mut ConnectionHandler) -> bool {
    let connected = WsMessage::new(
        CONNECTED_EVENT,
        &ConnectedData {
            client_id: Some(format!("client_{}", handler.peer_addr())),
            message: Some("WebSocket 连接成功".to_string()),
        },
    )
    .expect("构造 connected 消息失败");
    handler.send_message(&connected).await.is_ok()
}

// 模拟分析服务：握手后对心跳回复 pong，对图像分析回复一段流式文本和最终结果。
async fn analysis_server(
    mut handler: ConnectionHandler,
    mut receiver: ServerWsReceiver,
    seen_tx: mpsc::UnboundedSender<WsMessage>,
) {
    if !send_connected(&mut handler).await {
        return;
    }
    while let Some(Ok(message)) = receive_message(&mut receiver).await {
        info!("[Test Server] 收到消息: {}", message.event_type);
        let replies = match message.event_type.as_str() {
            HEARTBEAT_EVENT => vec![WsMessage::from_value(PONG_EVENT, json!({}))],
            IMAGE_ANALYSIS_EVENT => {
                let session_id = message.data["sessionId"].as_str().unwrap_or_default().to_string();
                vec![
                    WsMessage::from_value(
                        TEXT_STREAM_EVENT,
                        json!({ "content": "正在分析", "is_final": false, "sessionId": session_id }),
                    ),
                    WsMessage::from_value(FINAL_RESULT_EVENT, json!({ "text": "一张桌子", "sessionId": session_id })),
                ]
            }
            _ => Vec::new(),
        };
        let _ = seen_tx.send(message);
        for reply in replies {
            if handler.send_message(&reply).await.is_err() {
                return;
            }
        }
    }
}

async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) {
    let mut status = manager.watch_status();
    timeout(Duration::from_secs(10), status.wait_for(|state| *state == expected))
        .await
        .unwrap_or_else(|_| panic!("等待 {} 状态超时，当前: {}", expected, manager.get_connection_status()))
        .expect("状态通道意外关闭");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_capture_is_delivered_and_answered() {
    init_test_logger();

    let server = WsServer::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = server.local_addr();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<WsMessage>();
    let server_handle = tokio::spawn(server.serve(move |handler, receiver| {
        analysis_server(handler, receiver, seen_tx.clone())
    }));

    let bus = EventBus::new();
    let mut completions = bus.subscribe_topic(EventTopic::ProcessingComplete);
    let manager = ConnectionManager::with_websocket(config_for(addr), bus.clone()).expect("配置应合法");

    // 启动前提交的图像先进入出站队列
    manager.capture_completed("aGVsbG8=".to_string(), "it-1".to_string());
    manager.start().await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let first = timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("服务端未收到补发的消息")
        .expect("通道意外关闭");
    assert_eq!(first.event_type, IMAGE_ANALYSIS_EVENT, "握手后第一条应是补发的图像分析请求");
    assert_eq!(first.session_id.as_deref(), Some("it-1"));
    assert_eq!(first.data["format"], "base64");

    let completion = timeout(Duration::from_secs(5), completions.recv())
        .await
        .expect("未收到分析完成通知")
        .expect("事件通道意外关闭");
    assert_eq!(
        completion,
        CommEvent::ProcessingComplete {
            session_id: Some("it-1".to_string()),
            text: "一张桌子".to_string(),
        }
    );

    // 快照命令排在通知之后处理，此时统计副本已同步
    manager.snapshot().await.expect("后台任务应在运行");
    let stats = manager.get_stats().await;
    assert!(stats.messages_sent >= 1);
    assert!(stats.messages_received >= 3, "握手、流式文本与最终结果都应计入");

    manager.stop().await;
    assert_eq!(manager.get_connection_status(), ConnectionState::Disconnected);
    server_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_is_answered_without_warning() {
    init_test_logger();

    let server = WsServer::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = server.local_addr();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<WsMessage>();
    let server_handle = tokio::spawn(server.serve(move |handler, receiver| {
        analysis_server(handler, receiver, seen_tx.clone())
    }));

    let bus = EventBus::new();
    let mut heartbeat = bus.subscribe_topic(EventTopic::Heartbeat);
    let manager = ConnectionManager::with_websocket(config_for(addr), bus.clone()).expect("配置应合法");
    manager.start().await;
    wait_for_state(&manager, ConnectionState::Connected).await;

    let mut probes = 0;
    while probes < 3 {
        let message = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("服务端未收到心跳探测")
            .expect("通道意外关闭");
        if message.event_type == HEARTBEAT_EVENT {
            probes += 1;
        }
    }
    assert!(heartbeat.try_recv().is_none(), "对端按时应答时不应有心跳警告");
    assert_eq!(manager.get_connection_status(), ConnectionState::Connected);

    manager.stop().await;
    server_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_after_server_closes_connection() {
    init_test_logger();

    let server = WsServer::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = server.local_addr();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    let (seen_tx, _seen_rx) = mpsc::unbounded_channel::<WsMessage>();
    let server_handle = tokio::spawn(server.serve(move |mut handler, receiver| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let seen_tx = seen_tx.clone();
        async move {
            if n == 0 {
                // 第一次连接握手后立即关闭，迫使客户端重连
                send_connected(&mut handler).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                handler.close().await;
                drop(receiver);
                return;
            }
            analysis_server(handler, receiver, seen_tx).await;
        }
    }));

    let bus = EventBus::new();
    let mut connected = bus.subscribe_topic(EventTopic::Connected);
    let manager = ConnectionManager::with_websocket(config_for(addr), bus.clone()).expect("配置应合法");
    manager.start().await;

    for round in 1..=2 {
        timeout(Duration::from_secs(10), connected.recv())
            .await
            .unwrap_or_else(|_| panic!("第 {} 次连接未建立", round))
            .expect("事件通道意外关闭");
    }
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert_eq!(manager.snapshot().await.unwrap().reconnect_attempts, 0, "连接成功后重连计数应清零");

    manager.stop().await;
    server_handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_server_ends_in_error() {
    init_test_logger();

    // 绑定后立即释放，得到一个没有监听者的端口
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut config = config_for(addr);
    config.reconnect.max_attempts = 2;

    let bus = EventBus::new();
    let mut exceeded = bus.subscribe_topic(EventTopic::MaxAttemptsExceeded);
    let manager = ConnectionManager::with_websocket(config, bus.clone()).expect("配置应合法");
    manager.start().await;

    let event = timeout(Duration::from_secs(10), exceeded.recv())
        .await
        .expect("未收到重连次数耗尽通知")
        .expect("事件通道意外关闭");
    assert_eq!(event, CommEvent::MaxAttemptsExceeded { attempts: 2, max: 2 });
    wait_for_state(&manager, ConnectionState::Error).await;
    assert!(!manager.test_connection().await, "服务不可达时健康检查应失败");

    manager.stop().await;
}
