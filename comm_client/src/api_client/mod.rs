// comm_client/src/api_client/mod.rs

//! HTTP 备用通道。
//!
//! WebSocket 不可用时，一次性的图像分析请求可以改走 `POST {basePath}/analyze`；
//! 健康检查 (`GET {basePath}/health`) 也通过这里完成。请求按配置的次数重试，
//! 每次尝试有独立的超时，重试之间等待固定的间隔。

pub mod service;

pub use service::HttpApiClient;
