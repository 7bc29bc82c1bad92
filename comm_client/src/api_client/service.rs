// comm_client/src/api_client/service.rs

//! 基于 `reqwest` 的 HTTP 客户端。

use std::time::Duration;

use common_models::ws_payloads::{AnalyzeRequest, AnalyzeResponse, HealthResponse};
use log::{debug, error, info, warn};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ConnectionConfig;
use crate::error::CommError;

pub const ANALYZE_PATH: &str = "/analyze";
pub const HEALTH_PATH: &str = "/health";

/// HTTP 备用通道客户端。内部的 `reqwest::Client` 共享连接池，可以廉价克隆。
#[derive(Debug, Clone, Default)]
pub struct HttpApiClient {
    http_client: Client,
}

impl HttpApiClient {
    pub fn new() -> Self {
        Self {
            http_client: Client::new(),
        }
    }

    /// 发送一次 JSON 请求，失败时按 `http.maxRetries` 重试，全部失败后返回最后一次的错误。
    ///
    /// 非 2xx 响应视为失败并参与重试。
    pub async fn request_json<B, R>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        timeout: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<R, CommError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut last_error = CommError::Http(format!("请求 {} 未执行", url));
        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("[API客户端] {}ms 后进行第 {} 次重试: {}", retry_delay.as_millis(), attempt, url);
                tokio::time::sleep(retry_delay).await;
            }
            match self.try_once(method.clone(), url, body, timeout).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("[API客户端] 请求 {} 第 {} 次尝试失败: {}", url, attempt + 1, e);
                    last_error = e;
                }
            }
        }
        error!("[API客户端] 请求 {} 在 {} 次尝试后仍失败。", url, max_retries + 1);
        Err(last_error)
    }

    async fn try_once<B, R>(&self, method: Method, url: &str, body: Option<&B>, timeout: Duration) -> Result<R, CommError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.http_client.request(method, url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let err_text = response
                .text()
                .await
                .unwrap_or_else(|_| "无法读取错误响应体".to_string());
            return Err(CommError::Http(format!("状态码={}, 错误={}", status, err_text)));
        }
        Ok(response.json::<R>().await?)
    }

    /// 通过 HTTP 提交一次图像分析，返回服务端给出的文本。
    pub async fn analyze(&self, config: &ConnectionConfig, request: &AnalyzeRequest) -> Result<String, CommError> {
        let url = config.server.http_endpoint(ANALYZE_PATH);
        info!("[API客户端] 通过 HTTP 提交图像分析 (会话: {}) 到 {}", request.session_id, url);
        let response: AnalyzeResponse = self
            .request_json(
                Method::POST,
                &url,
                Some(request),
                Duration::from_millis(config.http.analyze_timeout_ms),
                config.http.max_retries,
                Duration::from_millis(config.http.retry_delay_ms),
            )
            .await?;
        response
            .text
            .ok_or_else(|| CommError::ProtocolParse("分析响应缺少 text 字段".to_string()))
    }

    /// 健康检查，只尝试一次。
    pub async fn health(&self, config: &ConnectionConfig) -> Result<HealthResponse, CommError> {
        let url = config.server.http_endpoint(HEALTH_PATH);
        debug!("[API客户端] 健康检查: {}", url);
        self.request_json::<(), HealthResponse>(
            Method::GET,
            &url,
            None,
            Duration::from_millis(config.http.health_timeout_ms),
            0,
            Duration::ZERO,
        )
        .await
    }
}
