//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了通信模块（`comm_client`）、WebSocket 传输库（`rust_websocket_utils`）
//! 以及远端分析服务之间共享的数据结构和枚举类型。
//!
//! 主要包含以下类型的模型：
//! - **WebSocket 消息负载 (`ws_payloads`)**: 出站 (`image_analysis`、`heartbeat`) 与入站
//!   (`connected`、`text_stream`、`final_result` 等) 消息中 `data` 字段的结构体，以及事件类型名称常量。
//! - **通用枚举 (`enums`)**: 连接状态 (`ConnectionState`)、客户端类型 (`ClientType`) 与入站事件类型。
//!
//! 所有模型都派生 `Serialize`/`Deserialize`/`Debug`/`Clone`，字段名与线上 JSON 保持一致（camelCase）。

pub mod enums;
pub mod ws_payloads;
