// rust_websocket_utils/tests/server_transport_integration_test.rs

use common_models::ws_payloads::{ConnectedData, CONNECTED_EVENT, PONG_EVENT};
use futures_util::{SinkExt, StreamExt};
use log::{info, LevelFilter};
use rust_websocket_utils::message::WsMessage;
use rust_websocket_utils::server::transport::{receive_message, ConnectionHandler, ServerWsReceiver, WsServer};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as TungsteniteMessage};

fn init_test_logger() {
    let _ = env_logger::builder().filter_level(LevelFilter::Info).is_test(true).try_init();
}

// 模拟分析服务的握手：连接建立后先发送 connected，再对每条消息回复 pong。
async fn handshake_then_pong(
    mut handler: ConnectionHandler,
    mut receiver: ServerWsReceiver,
    seen_tx: mpsc::UnboundedSender<WsMessage>,
) {
    let connected = WsMessage::new(
        CONNECTED_EVENT,
        &ConnectedData { client_id: Some(format!("client_{}", handler.peer_addr())), message: Some("WebSocket 连接成功".to_string()) },
    )
    .expect("构造 connected 消息失败");
    if handler.send_message(&connected).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = receive_message(&mut receiver).await {
        info!("[Test Server] 收到消息: {}", message.event_type);
        let _ = seen_tx.send(message);
        let pong = WsMessage::from_value(PONG_EVENT, serde_json::json!({}));
        if handler.send_message(&pong).await.is_err() {
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_sends_handshake_and_answers_heartbeat() {
    init_test_logger();

    let server = WsServer::bind("127.0.0.1:0").await.expect("无法绑定到随机端口");
    let addr = server.local_addr();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<WsMessage>();
    let server_handle = tokio::spawn(server.serve(move |handler, receiver| {
        handshake_then_pong(handler, receiver, seen_tx.clone())
    }));

    let (mut client, _response) = connect_async(format!("ws://{}", addr)).await.expect("客户端连接失败");

    let first = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("等待握手消息超时")
        .expect("连接意外关闭")
        .expect("读取握手消息失败");
    let TungsteniteMessage::Text(text) = first else {
        panic!("握手消息应为文本帧，实际: {:?}", first);
    };
    let handshake = WsMessage::from_json_str(&text).expect("握手消息解析失败");
    assert_eq!(handshake.event_type, CONNECTED_EVENT);
    let data: ConnectedData = handshake.deserialize_data().unwrap();
    assert!(data.client_id.is_some(), "握手消息应携带 clientId");

    let heartbeat = r#"{"eventType":"heartbeat","data":{"timestamp":1},"timestamp":1}"#;
    client.send(TungsteniteMessage::Text(heartbeat.to_string())).await.expect("发送心跳失败");

    let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("等待 pong 超时")
        .expect("连接意外关闭")
        .expect("读取 pong 失败");
    let TungsteniteMessage::Text(reply) = reply else {
        panic!("pong 应为文本帧");
    };
    assert_eq!(WsMessage::from_json_str(&reply).unwrap().event_type, PONG_EVENT);

    let seen = seen_rx.recv().await.expect("服务端应记录收到的心跳");
    assert_eq!(seen.event_type, "heartbeat");
    assert_eq!(seen.timestamp_millis(), Some(1));

    let _ = client.close(None).await;
    server_handle.abort();
}
