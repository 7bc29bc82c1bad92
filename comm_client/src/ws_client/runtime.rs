// comm_client/src/ws_client/runtime.rs

//! 运行时配置控制器。
//!
//! 负责判断一个补丁是否需要生效，以及生效时需要改动什么；真正的副作用（断开、重连、切换模式、
//! 调整退避与心跳）由连接管理器执行。判断规则：
//! - 补丁先规范化，再把判重部分（服务器地址与模拟后端开关）与上一次已生效的做结构比较，
//!   相同且不带其他参数时忽略；
//! - 有补丁正在应用时，新补丁被忽略而不是交错执行；
//! - 合并后的整份配置校验失败时返回 `ConfigError`，不记录为已生效，当前配置保持不变。

use log::{debug, warn};

use crate::config::{ConnectionConfig, HeartbeatConfig, HttpConfig, ReconnectConfig, RuntimeConfigPatch, ServerConfig};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchDecision {
    /// 需要应用，附带规范化后的补丁。
    Apply(RuntimeConfigPatch),
    /// 与上一次已生效的补丁相同。
    Duplicate,
    /// 另一个补丁正在应用。
    Busy,
    /// 补丁不包含任何字段。
    Empty,
}

/// 补丁相对当前配置的实际改动。每个字段与当前取值相同时为 `None`。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchPlan {
    /// 合并并校验后的新地址。
    pub server: Option<ServerConfig>,
    pub reconnect: Option<ReconnectConfig>,
    pub heartbeat: Option<HeartbeatConfig>,
    pub http: Option<HttpConfig>,
    /// 新的模拟后端开关。
    pub simulated: Option<bool>,
}

impl PatchPlan {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    /// 除模式切换外是否还改动了配置。
    pub fn changes_config(&self) -> bool {
        self.server.is_some() || self.reconnect.is_some() || self.heartbeat.is_some() || self.http.is_some()
    }
}

#[derive(Debug, Default)]
pub struct RuntimeConfigController {
    last_signature: Option<RuntimeConfigPatch>,
    in_flight: bool,
}

impl RuntimeConfigController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 判断补丁是否需要应用。返回 `Apply` 时进入“应用中”，必须随后调用 `finish`。
    pub fn begin(&mut self, patch: &RuntimeConfigPatch) -> PatchDecision {
        if self.in_flight {
            warn!("[运行时配置] 上一个配置补丁尚未应用完成，已忽略新的补丁。");
            return PatchDecision::Busy;
        }
        let normalized = patch.normalized();
        if normalized.is_empty() {
            return PatchDecision::Empty;
        }
        if !normalized.has_tuning() && self.last_signature.as_ref() == Some(&normalized.signature()) {
            debug!("[运行时配置] 补丁与上一次已生效的相同，跳过。");
            return PatchDecision::Duplicate;
        }
        self.in_flight = true;
        PatchDecision::Apply(normalized)
    }

    /// 计算补丁相对当前配置的改动。整份配置先合并校验，任何字段非法都不会产生部分改动。
    pub fn plan(&self, patch: &RuntimeConfigPatch, config: &ConnectionConfig) -> Result<PatchPlan, ConfigError> {
        let merged = config.merged(patch)?;
        Ok(PatchPlan {
            server: (merged.server != config.server).then_some(merged.server),
            reconnect: (merged.reconnect != config.reconnect).then_some(merged.reconnect),
            heartbeat: (merged.heartbeat != config.heartbeat).then_some(merged.heartbeat),
            http: (merged.http != config.http).then_some(merged.http),
            simulated: patch
                .use_simulated_backend
                .filter(|flag| *flag != config.use_simulated_backend),
        })
    }

    /// 结束应用。`applied` 为 `Some` 且带有地址或模式时，记录其判重部分。
    pub fn finish(&mut self, applied: Option<RuntimeConfigPatch>) {
        self.in_flight = false;
        if let Some(signature) = applied.map(|patch| patch.signature()).filter(|sig| !sig.is_empty()) {
            self.last_signature = Some(signature);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfigPatch, ReconnectConfigPatch, ServerConfigPatch};

    fn address_patch(ws_url: &str) -> RuntimeConfigPatch {
        RuntimeConfigPatch::server(ServerConfigPatch {
            ws_url: Some(ws_url.to_string()),
            ..Default::default()
        })
    }

    fn heartbeat_patch(interval_ms: u64) -> RuntimeConfigPatch {
        RuntimeConfigPatch {
            heartbeat: Some(HeartbeatConfigPatch { interval_ms: Some(interval_ms) }),
            ..Default::default()
        }
    }

    fn apply(controller: &mut RuntimeConfigController, patch: &RuntimeConfigPatch) -> RuntimeConfigPatch {
        match controller.begin(patch) {
            PatchDecision::Apply(normalized) => {
                controller.finish(Some(normalized.clone()));
                normalized
            }
            other => panic!("补丁应被应用，实际: {:?}", other),
        }
    }

    #[test]
    fn test_same_patch_is_applied_once() {
        let mut controller = RuntimeConfigController::new();
        let patch = address_patch("ws://10.0.0.1:8000/ws");
        apply(&mut controller, &patch);

        assert_eq!(controller.begin(&patch), PatchDecision::Duplicate);
        assert_eq!(
            controller.begin(&address_patch(" http://10.0.0.1:8000/ws/ ")),
            PatchDecision::Duplicate,
            "规范化后相同的补丁也应视为重复"
        );
        assert!(matches!(controller.begin(&address_patch("ws://10.0.0.2:8000/ws")), PatchDecision::Apply(_)));
    }

    #[test]
    fn test_in_flight_guard_rejects_nested_patch() {
        let mut controller = RuntimeConfigController::new();
        assert!(matches!(controller.begin(&RuntimeConfigPatch::simulated(true)), PatchDecision::Apply(_)));
        assert!(controller.in_flight);
        assert_eq!(controller.begin(&RuntimeConfigPatch::simulated(false)), PatchDecision::Busy);
        controller.finish(None);
        assert!(!controller.in_flight);
        assert_eq!(controller.last_signature, None, "未成功应用的补丁不应被记录");
        assert_eq!(controller.begin(&RuntimeConfigPatch::default()), PatchDecision::Empty);
    }

    #[test]
    fn test_tuning_patch_is_not_deduplicated_by_signature() {
        let mut controller = RuntimeConfigController::new();
        let address = address_patch("ws://10.0.0.1:8000/ws");
        apply(&mut controller, &address);

        // 地址相同但带有心跳参数，仍需交给差异计算
        let mut with_heartbeat = address.clone();
        with_heartbeat.heartbeat = Some(HeartbeatConfigPatch { interval_ms: Some(5000) });
        apply(&mut controller, &with_heartbeat);
        assert_eq!(controller.last_signature, Some(address.normalized().signature()));

        // 只带调优参数的补丁不改变判重记录
        apply(&mut controller, &heartbeat_patch(8000));
        assert_eq!(controller.begin(&address), PatchDecision::Duplicate);
    }

    #[test]
    fn test_plan_diffs_against_current_config() {
        let controller = RuntimeConfigController::new();
        let config = ConnectionConfig::default();

        let same = RuntimeConfigPatch {
            server: Some(ServerConfigPatch {
                ws_url: Some(config.server.ws_url.clone()),
                ..Default::default()
            }),
            heartbeat: Some(HeartbeatConfigPatch { interval_ms: Some(config.heartbeat.interval_ms) }),
            use_simulated_backend: Some(false),
            ..Default::default()
        };
        assert!(controller.plan(&same, &config).unwrap().is_noop(), "与当前配置相同的补丁不应产生改动");

        let plan = controller
            .plan(
                &RuntimeConfigPatch {
                    server: Some(ServerConfigPatch {
                        http_url: Some("http://10.0.0.9:8000".to_string()),
                        ..Default::default()
                    }),
                    reconnect: Some(ReconnectConfigPatch { max_attempts: Some(2), ..Default::default() }),
                    use_simulated_backend: Some(true),
                    ..Default::default()
                },
                &config,
            )
            .unwrap();
        assert_eq!(plan.server.unwrap().http_url, "http://10.0.0.9:8000");
        assert_eq!(plan.reconnect.map(|r| r.max_attempts), Some(2));
        assert_eq!(plan.heartbeat, None);
        assert_eq!(plan.simulated, Some(true));

        assert!(controller.plan(&address_patch("mailto:someone"), &config).is_err());
        assert!(controller.plan(&heartbeat_patch(0), &config).is_err(), "心跳周期为 0 应被拒绝");
    }
}
