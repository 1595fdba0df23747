//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建注册发现所需的全部组件

use std::sync::Arc;

use tracing::info;

use crate::config::DiscoveryAppConfig;
use crate::coordination::CoordinationClient;
use crate::error::Result;
use crate::lifecycle::{Lifecycle, LifecycleOrchestrator};

/// 注册发现上下文 - 包含所有已初始化的组件
pub struct DiscoveryContext {
    pub client: Arc<dyn CoordinationClient>,
    pub orchestrator: Arc<LifecycleOrchestrator>,
}

/// 构建注册发现上下文
///
/// # 参数
/// * `config` - 应用配置
/// * `client` - 进程共享的协调服务客户端
pub fn initialize(
    config: &DiscoveryAppConfig,
    client: Arc<dyn CoordinationClient>,
) -> Result<DiscoveryContext> {
    // 1. 校验配置并构建编排器（内部按激活判定决定是否创建依赖解析器）
    let orchestrator = Arc::new(LifecycleOrchestrator::new(config, client.clone())?);

    info!(
        service = %config.service.name,
        enabled = orchestrator.is_enabled(),
        port = orchestrator.configured_port(),
        dependencies = orchestrator
            .resolver()
            .map(|r| r.dependency_names().len())
            .unwrap_or(0),
        "discovery context initialized"
    );

    Ok(DiscoveryContext {
        client,
        orchestrator,
    })
}
