// comm_client/src/config.rs

//! 通信模块的配置管理。
//!
//! 本模块定义连接配置 (`ConnectionConfig`) 及其各个子配置，提供从 JSON 文件加载/保存、
//! 环境变量覆盖、整体校验，以及运行时配置补丁 (`RuntimeConfigPatch`) 的规范化与合并。
//!
//! 服务器地址的合并遵循“先校验、后替换”：补丁合并后的整个 `ServerConfig` 必须通过校验，
//! 才会作为一个整体替换原有地址，任何一个字段不合法都会返回 `ConfigError`，原配置保持不变。

use std::{fs, path::Path};

use anyhow::Context;
use common_models::enums::ClientType;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// 服务器地址子配置。三个字段作为一个整体被替换。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// WebSocket 地址，例如 `ws://localhost:8000/ws`。
    pub ws_url: String,
    /// HTTP 地址，例如 `http://localhost:8000`。
    pub http_url: String,
    /// HTTP 接口前缀，例如 `/api/v1`。
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws".to_string(),
            http_url: "http://localhost:8000".to_string(),
            base_path: "/api/v1".to_string(),
        }
    }
}

impl ServerConfig {
    /// 规范化并校验地址。
    ///
    /// - 去除首尾空白与末尾的 `/`；
    /// - WebSocket 地址若写成 `http(s)://`，改写为 `ws(s)://`；
    /// - HTTP 地址只接受 `http`/`https`；
    /// - `basePath` 为空或以 `/` 开头。
    pub fn normalized(&self) -> Result<ServerConfig, ConfigError> {
        let ws_url = normalize_ws_url(&self.ws_url)?;
        let http_url = normalize_http_url(&self.http_url)?;
        let base_path = self.base_path.trim().trim_end_matches('/').to_string();
        if !base_path.is_empty() && !base_path.starts_with('/') {
            return Err(ConfigError::InvalidBasePath(base_path));
        }
        Ok(ServerConfig { ws_url, http_url, base_path })
    }

    /// 把补丁叠加到当前地址上，返回校验通过的新地址。
    pub fn merged(&self, patch: &ServerConfigPatch) -> Result<ServerConfig, ConfigError> {
        let candidate = ServerConfig {
            ws_url: patch.ws_url.clone().unwrap_or_else(|| self.ws_url.clone()),
            http_url: patch.http_url.clone().unwrap_or_else(|| self.http_url.clone()),
            base_path: patch.base_path.clone().unwrap_or_else(|| self.base_path.clone()),
        };
        candidate.normalized()
    }

    /// 拼接 HTTP 接口地址：`{httpUrl}{basePath}{path}`。
    pub fn http_endpoint(&self, path: &str) -> String {
        format!("{}{}{}", self.http_url.trim_end_matches('/'), self.base_path, path)
    }
}

fn normalize_ws_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyAddress { field: "server.wsUrl" });
    }
    let rewritten = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };
    check_url(&rewritten, "server.wsUrl", &["ws", "wss"], "ws:// 或 wss://")?;
    Ok(rewritten)
}

fn normalize_http_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyAddress { field: "server.httpUrl" });
    }
    check_url(trimmed, "server.httpUrl", &["http", "https"], "http:// 或 https://")?;
    Ok(trimmed.to_string())
}

fn check_url(
    value: &str,
    field: &'static str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    let parsed = Url::parse(value).map_err(|e| ConfigError::InvalidAddress {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            field,
            value: value.to_string(),
            expected,
        });
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
            reason: "缺少主机名".to_string(),
        });
    }
    Ok(())
}

/// 断线重连子配置。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// 单次断线后最多自动重连的次数。
    pub max_attempts: u32,
    /// 第一次重连的基础等待时间，之后按 2 的幂增长。
    pub base_interval_ms: u64,
    /// 退避等待时间的上限（抖动之前）。
    pub cap_ms: u64,
    /// 单次连接尝试（含服务端握手确认）的截止时间。
    pub timeout_ms: u64,
    /// 是否需要等到服务端 `connected` 消息才进入已连接状态。
    pub require_peer_ack: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_interval_ms: 3000,
            cap_ms: 30_000,
            timeout_ms: 10_000,
            require_peer_ack: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000 }
    }
}

/// HTTP 备用通道子配置。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// 通用请求的单次超时。
    pub timeout_ms: u64,
    /// 首次请求失败后的最大重试次数。
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// 图像分析请求的单次超时。
    pub analyze_timeout_ms: u64,
    /// 健康检查请求的单次超时。
    pub health_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_retries: 3,
            retry_delay_ms: 1000,
            analyze_timeout_ms: 30_000,
            health_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// 出站队列容量，满时丢弃最早的消息。
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// 传输加密开关。仅作为配置透传，本模块不实现加密。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub enable_encryption: bool,
    pub encryption_key: Option<String>,
}

/// 图像压缩参数。压缩由采集端完成，这里只把开关写入 `image_analysis` 负载。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    pub enable: bool,
    pub algorithm: String,
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enable: true,
            algorithm: "gzip".to_string(),
            threshold: 1024,
        }
    }
}

/// 通信模块的完整配置。
///
/// 只由连接管理器持有和修改；外部通过 `ConnectionManager::get_config` 拿到的是只读快照。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub server: ServerConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub http: HttpConfig,
    pub queue: QueueConfig,
    pub security: SecurityConfig,
    pub compression: CompressionConfig,
    /// 是否使用本地模拟后端代替真实服务器。
    pub use_simulated_backend: bool,
    /// 模拟后端开始推送结果前的延迟。
    pub simulated_response_delay_ms: u64,
    pub client_type: ClientType,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            security: SecurityConfig::default(),
            compression: CompressionConfig::default(),
            use_simulated_backend: false,
            simulated_response_delay_ms: 2000,
            client_type: ClientType::Mobile,
        }
    }
}

/// 从单一基础地址（例如 `http://192.168.1.10:8000`）同时派生 WebSocket 与 HTTP 地址的环境变量。
pub const ENV_SERVER_URL: &str = "SEEFORME_SERVER_URL";
pub const ENV_WS_URL: &str = "SEEFORME_WS_URL";
pub const ENV_HTTP_URL: &str = "SEEFORME_HTTP_URL";
/// 取值 `1`/`true`/`yes` 时启用模拟后端。
pub const ENV_USE_MOCK: &str = "SEEFORME_USE_MOCK";

impl ConnectionConfig {
    /// 从 JSON 文件加载配置。文件中缺失的字段使用默认值，加载后做规范化与校验。
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ConnectionConfig> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件 '{}' 失败", path.display()))?;
        let mut config: ConnectionConfig = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件 '{}' 的内容失败", path.display()))?;
        config.server = config
            .server
            .normalized()
            .with_context(|| format!("配置文件 '{}' 中的服务器地址无效", path.display()))?;
        config
            .validate()
            .with_context(|| format!("配置文件 '{}' 校验失败", path.display()))?;
        info!("[配置模块] 已从 '{}' 加载通信配置。", path.display());
        Ok(config)
    }

    /// 文件存在时加载，不存在时使用默认配置。
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<ConnectionConfig> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            warn!("[配置模块] 配置文件 '{}' 未找到，将使用默认配置。", path.display());
            Ok(ConnectionConfig::default())
        }
    }

    /// 以格式化 JSON 保存配置，必要时创建父目录。
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent_dir) = path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                fs::create_dir_all(parent_dir)
                    .with_context(|| format!("创建配置目录 '{}' 失败", parent_dir.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(self).context("序列化通信配置失败")?;
        fs::write(path, content).with_context(|| format!("写入配置文件 '{}' 失败", path.display()))?;
        info!("[配置模块] 通信配置已保存至 '{}'。", path.display());
        Ok(())
    }

    /// 使用进程环境变量覆盖配置。
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// 使用给定的查找函数覆盖配置，便于在不修改进程环境的情况下测试。
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut patch = ServerConfigPatch::default();
        if let Some(base) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            let base = base.trim().trim_end_matches('/').to_string();
            patch.http_url = Some(base.clone());
            patch.ws_url = Some(format!("{}/ws", base));
        }
        if let Some(ws_url) = lookup(ENV_WS_URL).filter(|v| !v.trim().is_empty()) {
            patch.ws_url = Some(ws_url);
        }
        if let Some(http_url) = lookup(ENV_HTTP_URL).filter(|v| !v.trim().is_empty()) {
            patch.http_url = Some(http_url);
        }
        if !patch.is_empty() {
            self.server = self.server.merged(&patch)?;
            info!("[配置模块] 已应用环境变量中的服务器地址: {}", self.server.ws_url);
        }
        if let Some(flag) = lookup(ENV_USE_MOCK) {
            self.use_simulated_backend = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// 逐个校验子配置。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.normalized()?;
        if self.reconnect.base_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.baseIntervalMs",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.reconnect.cap_ms < self.reconnect.base_interval_ms {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.capMs",
                reason: format!("不能小于 baseIntervalMs ({})", self.reconnect.base_interval_ms),
            });
        }
        if self.reconnect.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.timeoutMs",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat.intervalMs",
                reason: "必须大于 0".to_string(),
            });
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.capacity",
                reason: "必须大于 0".to_string(),
            });
        }
        for (field, value) in [
            ("http.timeoutMs", self.http.timeout_ms),
            ("http.analyzeTimeoutMs", self.http.analyze_timeout_ms),
            ("http.healthTimeoutMs", self.http.health_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "必须大于 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// 把运行时补丁叠加到当前配置上，返回校验通过的完整新配置。
    ///
    /// 地址先整体合并校验，其余子配置逐字段覆盖后与整份配置一起校验；
    /// 任何一处不合法都返回 `ConfigError`，`self` 不受影响。模拟后端开关不在这里处理。
    pub fn merged(&self, patch: &RuntimeConfigPatch) -> Result<ConnectionConfig, ConfigError> {
        let mut candidate = self.clone();
        if let Some(server) = &patch.server {
            candidate.server = self.server.merged(server)?;
        }
        if let Some(reconnect) = &patch.reconnect {
            reconnect.apply_to(&mut candidate.reconnect);
        }
        if let Some(heartbeat) = &patch.heartbeat {
            heartbeat.apply_to(&mut candidate.heartbeat);
        }
        if let Some(http) = &patch.http {
            http.apply_to(&mut candidate.http);
        }
        candidate.validate()?;
        Ok(candidate)
    }

    /// 生成本次连接使用的 URL，附带 `clientType` 与 `timestamp` 查询参数。
    pub fn connect_url(&self, timestamp_ms: i64) -> Result<String, ConfigError> {
        let mut url = Url::parse(&self.server.ws_url).map_err(|e| ConfigError::InvalidAddress {
            field: "server.wsUrl",
            value: self.server.ws_url.clone(),
            reason: e.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("clientType", self.client_type.as_query_value())
            .append_pair("timestamp", &timestamp_ms.to_string());
        Ok(url.to_string())
    }
}

/// 服务器地址补丁，未给出的字段保持原值。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfigPatch {
    pub ws_url: Option<String>,
    pub http_url: Option<String>,
    pub base_path: Option<String>,
}

impl ServerConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.ws_url.is_none() && self.http_url.is_none() && self.base_path.is_none()
    }

    /// 规范化文本形式，使等价的补丁在结构上相等。无法规范化的字段保留原文，交给合并时校验。
    fn normalized(&self) -> ServerConfigPatch {
        ServerConfigPatch {
            ws_url: self
                .ws_url
                .as_deref()
                .map(|v| normalize_ws_url(v).unwrap_or_else(|_| v.trim().to_string())),
            http_url: self
                .http_url
                .as_deref()
                .map(|v| v.trim().trim_end_matches('/').to_string()),
            base_path: self
                .base_path
                .as_deref()
                .map(|v| v.trim().trim_end_matches('/').to_string()),
        }
    }
}

/// 重连参数补丁。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfigPatch {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_interval_ms: Option<u64>,
    pub cap_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl ReconnectConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply_to(&self, config: &mut ReconnectConfig) {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(base_interval_ms) = self.base_interval_ms {
            config.base_interval_ms = base_interval_ms;
        }
        if let Some(cap_ms) = self.cap_ms {
            config.cap_ms = cap_ms;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfigPatch {
    pub interval_ms: Option<u64>,
}

impl HeartbeatConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.interval_ms.is_none()
    }

    fn apply_to(&self, config: &mut HeartbeatConfig) {
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }
    }
}

/// HTTP 备用通道参数补丁。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfigPatch {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub analyze_timeout_ms: Option<u64>,
    pub health_timeout_ms: Option<u64>,
}

impl HttpConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply_to(&self, config: &mut HttpConfig) {
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(retry_delay_ms) = self.retry_delay_ms {
            config.retry_delay_ms = retry_delay_ms;
        }
        if let Some(analyze_timeout_ms) = self.analyze_timeout_ms {
            config.analyze_timeout_ms = analyze_timeout_ms;
        }
        if let Some(health_timeout_ms) = self.health_timeout_ms {
            config.health_timeout_ms = health_timeout_ms;
        }
    }
}

/// 运行时配置补丁：`ConnectionConfig` 的部分覆盖，加上可选的模拟后端开关。
///
/// 由事件通道送达。判重只看服务器地址与模拟后端开关（见 `signature`），
/// 重连、心跳与 HTTP 参数按与当前配置的差异生效，重复送达时没有差异，自然也没有副作用。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfigPatch {
    pub server: Option<ServerConfigPatch>,
    pub reconnect: Option<ReconnectConfigPatch>,
    pub heartbeat: Option<HeartbeatConfigPatch>,
    pub http: Option<HttpConfigPatch>,
    pub use_simulated_backend: Option<bool>,
}

impl RuntimeConfigPatch {
    pub fn server(patch: ServerConfigPatch) -> Self {
        Self {
            server: Some(patch),
            ..Self::default()
        }
    }

    pub fn simulated(use_simulated_backend: bool) -> Self {
        Self {
            use_simulated_backend: Some(use_simulated_backend),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signature().is_empty() && !self.has_tuning()
    }

    /// 是否包含重连、心跳或 HTTP 参数。
    pub fn has_tuning(&self) -> bool {
        self.reconnect.as_ref().is_some_and(|p| !p.is_empty())
            || self.heartbeat.as_ref().is_some_and(|p| !p.is_empty())
            || self.http.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// 判重用的部分：服务器地址与模拟后端开关。
    pub fn signature(&self) -> RuntimeConfigPatch {
        RuntimeConfigPatch {
            server: self.server.clone(),
            use_simulated_backend: self.use_simulated_backend,
            ..Self::default()
        }
    }

    /// 规范化：去除空白与末尾斜杠，空的子补丁视为未提供。
    pub fn normalized(&self) -> RuntimeConfigPatch {
        RuntimeConfigPatch {
            server: self
                .server
                .as_ref()
                .map(ServerConfigPatch::normalized)
                .filter(|patch| !patch.is_empty()),
            reconnect: self.reconnect.clone().filter(|patch| !patch.is_empty()),
            heartbeat: self.heartbeat.clone().filter(|patch| !patch.is_empty()),
            http: self.http.clone().filter(|patch| !patch.is_empty()),
            use_simulated_backend: self.use_simulated_backend,
        }
    }
}
