use anyhow::Result;
use discovery_host::ApplicationBootstrap;
use flare_zk_discovery::load_config;
use flare_zk_discovery::tracing::init_tracing_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置（config/ 目录优先，其次 config.toml）
    let app_config = load_config(None);

    init_tracing_from_config(Some(&app_config.logging));

    ApplicationBootstrap::run(app_config).await
}
