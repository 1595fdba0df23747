//! 应用启动器 - 负责依赖注入和生命周期驱动

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use flare_zk_discovery::coordination::{CoordinationClient, InMemoryEnsemble};
use flare_zk_discovery::{DiscoveryAppConfig, DiscoveryContext, Lifecycle, gather_metrics, initialize};
use tracing::{info, warn};

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点，收到 Ctrl+C 后停止
    pub async fn run(config: &'static DiscoveryAppConfig) -> Result<()> {
        Self::run_until(config, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
    }

    /// 运行直到 `shutdown` 完成
    pub async fn run_until<F>(config: &DiscoveryAppConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        // 本地运行使用进程内协调服务；接入真实集群时替换为对应的客户端实现
        let ensemble = InMemoryEnsemble::new();
        info!(
            connect_string = %config.zookeeper.connect_string,
            "using in-process coordination ensemble"
        );
        let context = Self::create_context(config, ensemble.connect())?;
        let orchestrator = context.orchestrator.clone();

        orchestrator
            .on_start()
            .await
            .context("failed to start service lifecycle")?;

        info!(
            service = %config.service.name,
            port = orchestrator.configured_port(),
            state = %orchestrator.state(),
            "discovery host started"
        );

        shutdown.await;

        info!("shutdown signal received, stopping discovery host");
        orchestrator.on_stop().await;
        tracing::debug!(metrics = %gather_metrics(), "final metrics snapshot");
        Ok(())
    }

    /// 创建应用上下文
    pub fn create_context(
        config: &DiscoveryAppConfig,
        client: Arc<dyn CoordinationClient>,
    ) -> Result<DiscoveryContext> {
        initialize(config, client).context("failed to initialize discovery context")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_until_registers_then_stops() {
        let config = DiscoveryAppConfig::from_toml_str(
            r#"
            [service]
            name = "host-test"

            [zookeeper]
            port = 7000
            "#,
        )
        .unwrap();

        ApplicationBootstrap::run_until(&config, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_fails_startup() {
        let mut config = DiscoveryAppConfig::default();
        config.zookeeper.root = String::new();

        let err = ApplicationBootstrap::run_until(&config, async {})
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid configuration"));
    }
}
