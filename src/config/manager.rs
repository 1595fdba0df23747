//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! 该模块提供了配置管理功能，包括：
//! - 加载环境特定配置（`environments/{FLARE_ENV}.toml`）
//! - 环境变量覆盖注册开关、端口与连接串

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;
use tracing::{info, warn};

use super::{DiscoveryAppConfig, merge_value};

/// 注册开关覆盖变量
pub const ENV_ENABLED: &str = "FLARE_ZK_ENABLED";
/// 端口覆盖变量
pub const ENV_PORT: &str = "FLARE_ZK_PORT";
/// 连接串覆盖变量
pub const ENV_CONNECT_STRING: &str = "FLARE_ZK_CONNECT_STRING";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 FLARE_ENV 获取当前环境名称，
    /// 如果未设置则默认为 "development"
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 根据当前环境加载特定配置并合并到基础配置中
    pub fn load_environment_config(base: &mut Value, env_dir: &Path) -> Result<()> {
        Self::load_environment_config_for(base, env_dir, &Self::get_environment())
    }

    /// 加载 `{env_dir}/{environment}.toml`，文件不存在时跳过
    pub fn load_environment_config_for(
        base: &mut Value,
        env_dir: &Path,
        environment: &str,
    ) -> Result<()> {
        let env_config_path = env_dir.join(format!("{environment}.toml"));
        if !env_config_path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&env_config_path).with_context(|| {
            format!(
                "unable to read environment config: {}",
                env_config_path.display()
            )
        })?;
        let overlay: Value = toml::from_str(&content).with_context(|| {
            format!(
                "invalid environment config format: {}",
                env_config_path.display()
            )
        })?;

        merge_value(base, overlay);
        info!(
            environment = %environment,
            path = %env_config_path.display(),
            "environment config merged"
        );
        Ok(())
    }

    /// 使用环境变量覆盖配置
    pub fn apply_env_overrides(config: &mut DiscoveryAppConfig) {
        Self::apply_overrides(config, |key| env::var(key).ok());
    }

    /// 覆盖逻辑，变量来源可注入
    pub fn apply_overrides<F>(config: &mut DiscoveryAppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_ENABLED) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => config.zookeeper.enabled = true,
                "false" | "0" | "no" => config.zookeeper.enabled = false,
                other => warn!(variable = ENV_ENABLED, value = %other, "ignoring invalid override"),
            }
        }

        if let Some(raw) = lookup(ENV_PORT) {
            match raw.trim().parse::<u16>() {
                Ok(port) => config.zookeeper.port = port,
                Err(err) => {
                    warn!(variable = ENV_PORT, value = %raw, error = %err, "ignoring invalid override")
                }
            }
        }

        if let Some(raw) = lookup(ENV_CONNECT_STRING).filter(|v| !v.trim().is_empty()) {
            config.zookeeper.connect_string = raw;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_environment_overlay_merges_nested_tables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("staging.toml"),
            "[zookeeper]\nconnect_string = \"zk-staging:2181\"\n",
        )
        .unwrap();

        let mut base: Value =
            toml::from_str("[zookeeper]\nport = 8080\nconnect_string = \"localhost:2181\"\n")
                .unwrap();
        ConfigManager::load_environment_config_for(&mut base, dir.path(), "staging").unwrap();

        let cfg: DiscoveryAppConfig = base.try_into().unwrap();
        assert_eq!(cfg.zookeeper.connect_string, "zk-staging:2181");
        assert_eq!(cfg.zookeeper.port, 8080);
    }

    #[test]
    fn test_missing_environment_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut base: Value = toml::from_str("[zookeeper]\nport = 1\n").unwrap();
        ConfigManager::load_environment_config_for(&mut base, dir.path(), "prod").unwrap();
        assert_eq!(base["zookeeper"]["port"].as_integer(), Some(1));
    }

    #[test]
    fn test_overrides_apply_and_ignore_invalid_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_ENABLED, "false"),
            (ENV_PORT, "not-a-port"),
            (ENV_CONNECT_STRING, "zk-1:2181,zk-2:2181"),
        ]);
        let mut cfg = DiscoveryAppConfig::default();
        cfg.zookeeper.port = 9000;

        ConfigManager::apply_overrides(&mut cfg, |key| vars.get(key).map(|v| v.to_string()));

        assert!(!cfg.zookeeper.enabled);
        assert_eq!(cfg.zookeeper.port, 9000);
        assert_eq!(cfg.zookeeper.connect_string, "zk-1:2181,zk-2:2181");
    }
}
