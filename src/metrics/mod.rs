//! # Prometheus 指标收集模块
//!
//! 服务注册与依赖解析的统一指标，注册在全局 `REGISTRY` 中。

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 全局注册发现指标
pub static DISCOVERY_METRICS: Lazy<DiscoveryMetrics> = Lazy::new(DiscoveryMetrics::new);

/// 注册发现指标
pub struct DiscoveryMetrics {
    /// 注册尝试次数（按结果）
    pub registration_attempts_total: IntCounterVec,
    /// 当前注册状态（数值编码）
    pub registration_state: IntGauge,
    /// 会话过期次数
    pub session_expirations_total: IntCounter,
    /// 注销次数（按结果）
    pub deregistrations_total: IntCounterVec,
    /// 依赖端点刷新次数（按服务、结果）
    pub endpoint_refresh_total: IntCounterVec,
    /// 依赖当前解析到的实例数
    pub resolved_endpoints: IntGaugeVec,
    /// 依赖端点集合是否过期（1 为过期）
    pub dependency_stale: IntGaugeVec,
}

impl DiscoveryMetrics {
    pub fn new() -> Self {
        let registration_attempts_total = IntCounterVec::new(
            Opts::new(
                "zk_registration_attempts_total",
                "Total number of coordination create attempts for service registration",
            ),
            &["outcome"],
        )
        .expect("Failed to create zk_registration_attempts_total metric");

        let registration_state = IntGauge::new(
            "zk_registration_state",
            "Current registration state (0=unregistered,1=registering,2=registered,3=deregistering,4=failed)",
        )
        .expect("Failed to create zk_registration_state metric");

        let session_expirations_total = IntCounter::new(
            "zk_session_expirations_total",
            "Total number of coordination session expirations observed",
        )
        .expect("Failed to create zk_session_expirations_total metric");

        let deregistrations_total = IntCounterVec::new(
            Opts::new(
                "zk_deregistrations_total",
                "Total number of deregistrations",
            ),
            &["outcome"],
        )
        .expect("Failed to create zk_deregistrations_total metric");

        let endpoint_refresh_total = IntCounterVec::new(
            Opts::new(
                "zk_endpoint_refresh_total",
                "Total number of dependency endpoint refreshes",
            ),
            &["service", "outcome"],
        )
        .expect("Failed to create zk_endpoint_refresh_total metric");

        let resolved_endpoints = IntGaugeVec::new(
            Opts::new(
                "zk_resolved_endpoints",
                "Number of live instances resolved per dependency",
            ),
            &["service"],
        )
        .expect("Failed to create zk_resolved_endpoints metric");

        let dependency_stale = IntGaugeVec::new(
            Opts::new(
                "zk_dependency_stale",
                "Whether the dependency endpoint set is stale (1) or fresh (0)",
            ),
            &["service"],
        )
        .expect("Failed to create zk_dependency_stale metric");

        // 注册指标，忽略重复注册错误
        let _ = REGISTRY.register(Box::new(registration_attempts_total.clone()));
        let _ = REGISTRY.register(Box::new(registration_state.clone()));
        let _ = REGISTRY.register(Box::new(session_expirations_total.clone()));
        let _ = REGISTRY.register(Box::new(deregistrations_total.clone()));
        let _ = REGISTRY.register(Box::new(endpoint_refresh_total.clone()));
        let _ = REGISTRY.register(Box::new(resolved_endpoints.clone()));
        let _ = REGISTRY.register(Box::new(dependency_stale.clone()));

        Self {
            registration_attempts_total,
            registration_state,
            session_expirations_total,
            deregistrations_total,
            endpoint_refresh_total,
            resolved_endpoints,
            dependency_stale,
        }
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 以 Prometheus 文本格式导出全部指标
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
