//! Flare ZK Discovery 错误模块
//!
//! - 统一的 `DiscoveryError` 错误类型，覆盖协调服务、状态机、依赖解析与配置错误
//! - `is_transient()` 用于区分可重试错误（连接丢失、超时）与致命错误

use std::time::Duration;

use thiserror::Error;

use crate::registration::RegistrationState;

/// 统一结果类型
pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;

/// 服务注册发现错误
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// 与协调服务的连接暂时丢失（可重试）
    #[error("transient coordination connection error: {0}")]
    TransientConnection(String),

    /// 节点已存在（注册时视为成功）
    #[error("node already exists: {0}")]
    NodeAlreadyExists(String),

    /// 节点不存在（注销时视为成功）
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// 协调服务会话过期
    #[error("coordination session expired")]
    SessionExpired,

    /// 未声明的依赖服务
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// 配置非法（启动期致命错误）
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// 当前状态不允许该操作
    #[error("illegal registration transition: `{event}` while {state}")]
    IllegalTransition {
        state: RegistrationState,
        event: &'static str,
    },

    /// 协调服务调用超时（可重试）
    #[error("coordination operation `{operation}` timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// 协调服务拒绝请求（如权限不足、路径非法）
    #[error("coordination request rejected: {0}")]
    Coordination(String),

    /// 节点数据无法解析为服务实例
    #[error("malformed instance payload at {path}: {source}")]
    MalformedPayload {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// 必需依赖没有可用实例
    #[error("required dependency `{0}` has no live instances")]
    RequiredDependencyUnavailable(String),

    /// 启动期注册失败（包装底层原因）
    #[error("service registration failed: {0}")]
    RegistrationFailed(#[source] Box<DiscoveryError>),
}

impl DiscoveryError {
    /// 是否为可重试的暂时性错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DiscoveryError::TransientConnection(_) | DiscoveryError::Timeout { .. }
        )
    }

    /// 指标标签使用的错误分类
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::TransientConnection(_) => "transient_connection",
            DiscoveryError::NodeAlreadyExists(_) => "node_already_exists",
            DiscoveryError::NodeNotFound(_) => "node_not_found",
            DiscoveryError::SessionExpired => "session_expired",
            DiscoveryError::UnknownDependency(_) => "unknown_dependency",
            DiscoveryError::ConfigurationInvalid(_) => "configuration_invalid",
            DiscoveryError::IllegalTransition { .. } => "illegal_transition",
            DiscoveryError::Timeout { .. } => "timeout",
            DiscoveryError::Coordination(_) => "coordination",
            DiscoveryError::MalformedPayload { .. } => "malformed_payload",
            DiscoveryError::RequiredDependencyUnavailable(_) => "required_dependency_unavailable",
            DiscoveryError::RegistrationFailed(_) => "registration_failed",
        }
    }
}

/// 便捷宏：以 `ConfigurationInvalid` 提前返回
#[macro_export]
macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err($crate::error::DiscoveryError::ConfigurationInvalid(format!($($arg)*)))
    };
}
