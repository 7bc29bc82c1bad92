// comm_client/src/main.rs

//! 通信模块的命令行入口，用于联调与现场排查。
//!
//! 启动连接管理器，把事件通道上的通知打印到日志，直到收到 Ctrl-C。
//! 可以在连接建立后提交若干图像文件，或只执行一次健康检查。

use std::path::PathBuf;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use comm_client::config::ConnectionConfig;
use comm_client::event::{CommEvent, EventBus, EventTopic};
use comm_client::{ConnectionManager, RuntimeConfigPatch, ServerConfigPatch};
use log::{error, info, warn, LevelFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "comm-client", version, about = "SeeForMe 通信模块调试客户端")]
struct Cli {
    /// JSON 配置文件路径，不存在时使用默认配置。
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 使用本地模拟后端，不连接服务器。
    #[arg(long)]
    mock: bool,

    /// 覆盖 WebSocket 地址。
    #[arg(long)]
    ws_url: Option<String>,

    /// 覆盖 HTTP 地址。
    #[arg(long)]
    http_url: Option<String>,

    /// 连接后提交的图像文件，可重复指定。
    #[arg(long = "image")]
    images: Vec<PathBuf>,

    /// 图像改走 HTTP 备用通道。
    #[arg(long)]
    via_http: bool,

    /// 只执行一次健康检查后退出。
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("comm_client", LevelFilter::Debug)
        .parse_default_env()
        .try_init()
        .context("初始化 env_logger 日志服务失败")?;

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ConnectionConfig::load_or_default(path)?,
        None => ConnectionConfig::default(),
    };
    config.apply_env_overrides().context("环境变量中的服务器地址非法")?;

    let bus = EventBus::new();
    let manager = ConnectionManager::with_websocket(config, bus.clone()).context("创建连接管理器失败")?;

    let patch = RuntimeConfigPatch {
        server: Some(ServerConfigPatch {
            ws_url: cli.ws_url.clone(),
            http_url: cli.http_url.clone(),
            base_path: None,
        }),
        use_simulated_backend: cli.mock.then_some(true),
        ..RuntimeConfigPatch::default()
    };
    if !patch.is_empty() {
        manager.update_config(patch).await.context("命令行地址参数非法")?;
    }

    if cli.health {
        let healthy = manager.test_connection().await;
        info!("[通信模块] 健康检查: {}", if healthy { "正常" } else { "不可用" });
        if !healthy {
            anyhow::bail!("服务不可用");
        }
        return Ok(());
    }

    let logger = spawn_event_logger(&bus);
    manager.start().await;

    if !cli.images.is_empty() {
        wait_until_ready(&manager).await;
        for path in &cli.images {
            let bytes = std::fs::read(path).with_context(|| format!("读取图像文件 {} 失败", path.display()))?;
            let image_data = STANDARD.encode(bytes);
            let session_id = Uuid::new_v4().to_string();
            info!("[通信模块] 提交图像 {} (会话: {})", path.display(), session_id);
            if cli.via_http {
                match manager.send_image_via_http(image_data, session_id.clone()).await {
                    Ok(Some(text)) => info!("[API客户端] 会话 {} 的分析结果: {}", session_id, text),
                    Ok(None) => info!("[API客户端] 会话 {} 已交给模拟后端。", session_id),
                    Err(e) => error!("[API客户端] 会话 {} 提交失败: {}", session_id, e),
                }
            } else {
                manager.capture_completed(image_data, session_id);
            }
        }
    }

    tokio::signal::ctrl_c().await.context("等待 Ctrl-C 失败")?;
    info!("[通信模块] 收到退出信号，正在停止...");
    manager.stop().await;
    let stats = manager.get_stats().await;
    if let Some(uptime_ms) = stats.uptime_ms(chrono::Utc::now()) {
        info!("[通信模块] 最近一次连接至今 {}ms。", uptime_ms);
    }
    info!("[通信模块] 最终统计: {:?}", stats);
    logger.abort();
    Ok(())
}

/// 等待进入可投递状态。超过十秒仍未就绪时继续，图像会先进入出站队列。
async fn wait_until_ready(manager: &ConnectionManager) {
    let mut status = manager.watch_status();
    let ready = tokio::time::timeout(std::time::Duration::from_secs(10), status.wait_for(|state| state.can_deliver()));
    if ready.await.is_err() {
        warn!("[通信模块] 连接尚未就绪 ({})，图像将先进入出站队列。", manager.get_connection_status());
    }
}

fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[事件通道] 日志输出落后，跳过了 {} 条通知。", skipped);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match (&event, event.topic()) {
                (CommEvent::MessageReceived(message), _) => {
                    info!(
                        "[事件通道] {} (会话: {:?}): {}",
                        message.event_type.as_str(),
                        message.session_id,
                        message.text.as_deref().unwrap_or("")
                    );
                }
                (CommEvent::Error(e), _) | (CommEvent::SendError { error: e, .. }, _) => {
                    if e.is_recoverable() {
                        warn!("[事件通道] 错误: {}", e);
                    } else {
                        error!("[事件通道] 错误: {}", e);
                    }
                }
                (_, EventTopic::Heartbeat) => warn!("[事件通道] 心跳: {:?}", event),
                (_, topic) => info!("[事件通道] {}: {:?}", topic.as_str(), event),
            }
        }
    })
}
