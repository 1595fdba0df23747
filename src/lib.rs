//! Flare ZK Discovery
//!
//! 基于协调服务（Zookeeper 语义）的服务注册生命周期管理与依赖发现：
//! - `registration`：注册状态机（临时节点、会话过期自动重新注册、端口变更）
//! - `dependency`：依赖清单解析、负载均衡与无锁端点缓存
//! - `activation`：依赖清单激活判定
//! - `lifecycle`：宿主启动 / 停止事件编排
//! - `coordination`：协调服务抽象与进程内实现

pub mod activation;
pub mod config;
pub mod coordination;
pub mod dependency;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod metrics;
pub mod registration;
pub mod tracing;
pub mod wire;

pub use activation::{ActivationOutcome, ActivationPredicate, should_activate};
pub use config::{
    ConfigManager, ConfigSnapshot, DependencyConfig, DiscoveryAppConfig, LoggingConfig,
    ZookeeperConfig, app_config, load_config,
};
pub use coordination::{CoordinationClient, CoordinationEvent, SessionEvent};
pub use dependency::{DependencyDescriptor, DependencyResolver, LoadBalancerType};
pub use error::{DiscoveryError, Result};
pub use instance::{InstanceTemplate, ServiceInstance, UriSpec};
pub use lifecycle::{Lifecycle, LifecycleOrchestrator};
pub use metrics::gather_metrics;
pub use registration::{RegistrationState, RegistrationStateMachine};
pub use wire::{DiscoveryContext, initialize};
