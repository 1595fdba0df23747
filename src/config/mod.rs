//! Flare ZK Discovery 配置模块
//!
//! 该模块提供了完整的配置管理功能，包括：
//! - 配置文件加载和解析（单文件或 `base.toml` + 片段目录）
//! - 环境特定配置覆盖与环境变量覆盖
//! - 注册中心与依赖清单配置定义
//! - 扁平化的只读配置快照（供激活判定使用）

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::warn;

use crate::bail_config;
use crate::dependency::LoadBalancerType;
use crate::instance::DEFAULT_URI_SPEC;

mod manager;
mod snapshot;

pub use manager::ConfigManager;
pub use snapshot::ConfigSnapshot;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<DiscoveryAppConfig> = OnceLock::new();

/// 服务基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// 服务名（注册路径中的服务段）
    #[serde(default = "default_service_name")]
    pub name: String,
    /// 服务版本
    #[serde(default = "default_service_version")]
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            version: default_service_version(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（`RUST_LOG` 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default)]
    pub with_thread_ids: bool,
    #[serde(default)]
    pub with_file: bool,
    #[serde(default)]
    pub with_line_number: bool,
    /// 输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 依赖声明
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// 依赖服务在注册中心中的路径（相对于 root）
    pub path: String,
    /// 负载均衡策略
    #[serde(default, alias = "loadBalancer", alias = "loadBalancerType")]
    pub load_balancer: LoadBalancerType,
    /// Content-Type 模板，`$version` 会被替换为版本号
    #[serde(
        default,
        alias = "contentTypeTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_type_template: Option<String>,
    /// 依赖版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// 调用依赖时附带的请求头
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 启动时必须至少有一个可用实例
    #[serde(default)]
    pub required: bool,
}

/// Zookeeper 注册发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// 是否启用服务注册
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 协调服务连接串
    #[serde(default = "default_connect_string", alias = "connectString")]
    pub connect_string: String,
    /// 服务注册根路径
    #[serde(default = "default_root")]
    pub root: String,
    /// 服务端口（0 表示尚未确定）
    #[serde(default)]
    pub port: u16,
    /// 注册的主机地址
    #[serde(default = "default_instance_host", alias = "instanceHost")]
    pub instance_host: String,
    /// 固定实例 ID（不设置时自动生成）
    #[serde(default, alias = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// SSL 端口
    #[serde(default, alias = "sslPort", skip_serializing_if = "Option::is_none")]
    pub ssl_port: Option<u16>,
    /// URI 模板
    #[serde(default = "default_uri_spec", alias = "uriSpec")]
    pub uri_spec: String,
    /// 实例元数据
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// 启动期注册失败是否终止启动
    #[serde(default = "default_true", alias = "failFast")]
    pub fail_fast: bool,
    /// 单次协调服务调用超时（毫秒）
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// 关闭时注销的硬性截止时间（毫秒）
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
    /// 暂时性错误重试前的退避时间（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 依赖清单
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyConfig>,
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connect_string: default_connect_string(),
            root: default_root(),
            port: 0,
            instance_host: default_instance_host(),
            instance_id: None,
            ssl_port: None,
            uri_spec: default_uri_spec(),
            metadata: BTreeMap::new(),
            fail_fast: true,
            operation_timeout_ms: default_operation_timeout_ms(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            dependencies: BTreeMap::new(),
        }
    }
}

impl ZookeeperConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// 校验配置，非法时返回 `ConfigurationInvalid`
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.root.is_empty() || !self.root.starts_with('/') {
            bail_config!("zookeeper.root `{}` must start with '/'", self.root);
        }
        if self.root.len() > 1 && self.root.ends_with('/') {
            bail_config!("zookeeper.root `{}` must not end with '/'", self.root);
        }
        if self.operation_timeout_ms == 0 {
            bail_config!("zookeeper.operation_timeout_ms must be greater than zero");
        }
        if self.shutdown_deadline_ms == 0 {
            bail_config!("zookeeper.shutdown_deadline_ms must be greater than zero");
        }
        if self.instance_host.trim().is_empty() {
            bail_config!("zookeeper.instance_host must not be empty");
        }
        for (name, dependency) in &self.dependencies {
            if dependency.path.trim().trim_matches('/').is_empty() {
                bail_config!("zookeeper.dependencies.{name}.path must not be empty");
            }
        }
        Ok(())
    }
}

/// Flare ZK Discovery 应用配置主结构体
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryAppConfig {
    /// 服务基本信息
    #[serde(default)]
    pub service: ServiceConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 注册发现配置
    #[serde(default)]
    pub zookeeper: ZookeeperConfig,
}

impl DiscoveryAppConfig {
    /// 从 TOML 文本解析
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: DiscoveryAppConfig = toml::from_str(content).context("invalid config format")?;
        Ok(cfg)
    }

    /// 生成扁平化配置快照
    pub fn snapshot(&self) -> ConfigSnapshot {
        match serde_json::to_value(self) {
            Ok(value) => ConfigSnapshot::from_json(&value),
            Err(err) => {
                warn!(error = %err, "failed to build configuration snapshot");
                ConfigSnapshot::default()
            }
        }
    }

    /// 校验整体配置
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.zookeeper.enabled && self.service.name.trim().is_empty() {
            bail_config!("service.name must not be empty when registration is enabled");
        }
        self.zookeeper.validate()
    }
}

/// 加载配置
pub fn load_config(path: Option<&str>) -> &'static DiscoveryAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
    };

    APP_CONFIG.get_or_init(|| {
        let mut cfg = load_with_fallback(&candidates);
        ConfigManager::apply_env_overrides(&mut cfg);
        cfg
    })
}

/// 获取已加载的应用配置
pub fn app_config() -> Option<&'static DiscoveryAppConfig> {
    APP_CONFIG.get()
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> DiscoveryAppConfig {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    DiscoveryAppConfig::default()
}

/// 从源加载配置（文件或目录），并叠加环境特定配置
pub fn load_config_from_source(path: &Path) -> Result<DiscoveryAppConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    let mut merged = if metadata.is_dir() {
        load_directory_value(path)?
    } else {
        load_toml_value(path)?
    };

    let env_dir = if metadata.is_dir() {
        path.join("environments")
    } else {
        path.parent()
            .map(|p| p.join("environments"))
            .unwrap_or_else(|| PathBuf::from("environments"))
    };
    ConfigManager::load_environment_config(&mut merged, &env_dir)?;

    let cfg: DiscoveryAppConfig = merged
        .try_into()
        .with_context(|| format!("invalid configuration after merging {}", path.display()))?;
    Ok(cfg)
}

/// 从目录加载配置：base.toml + shared/ + services/ + overrides/
fn load_directory_value(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 按文件名顺序合并目录中的 TOML 片段
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort();

    for entry in entries {
        let value = load_toml_value(&entry)?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 深度合并，表按键递归合并，其余类型直接覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "application".to_string()
}

fn default_service_version() -> String {
    "0.1.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_string() -> String {
    "localhost:2181".to_string()
}

fn default_root() -> String {
    "/services".to_string()
}

fn default_instance_host() -> String {
    "127.0.0.1".to_string()
}

fn default_uri_spec() -> String {
    DEFAULT_URI_SPEC.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    3_000
}

fn default_shutdown_deadline_ms() -> u64 {
    5_000
}

fn default_retry_backoff_ms() -> u64 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiscoveryError;

    const SAMPLE: &str = r#"
[service]
name = "newsletter"

[zookeeper]
port = 8080
metadata = { zone = "eu-1" }

[zookeeper.dependencies.mail]
path = "/mail-service"
loadBalancer = "random"
contentTypeTemplate = "application/vnd.mail.$version+json"
version = "v2"
headers = { "X-Tenant" = "flare" }
required = true
"#;

    #[test]
    fn test_parse_sample_with_defaults() {
        let cfg = DiscoveryAppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.service.name, "newsletter");
        assert!(cfg.zookeeper.enabled);
        assert_eq!(cfg.zookeeper.root, "/services");
        assert_eq!(cfg.zookeeper.port, 8080);
        assert_eq!(cfg.zookeeper.operation_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.zookeeper.shutdown_deadline(), Duration::from_secs(5));

        let mail = &cfg.zookeeper.dependencies["mail"];
        assert_eq!(mail.path, "/mail-service");
        assert_eq!(mail.load_balancer, LoadBalancerType::Random);
        assert_eq!(mail.version.as_deref(), Some("v2"));
        assert_eq!(mail.headers["X-Tenant"], "flare");
        assert!(mail.required);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_snapshot_flattens_dependencies() {
        let cfg = DiscoveryAppConfig::from_toml_str(SAMPLE).unwrap();
        let snapshot = cfg.snapshot();
        assert_eq!(
            snapshot.get("zookeeper.dependencies.mail.path"),
            Some("/mail-service")
        );
        assert_eq!(
            snapshot.get("zookeeper.dependencies.mail.headers.X-Tenant"),
            Some("flare")
        );
        assert_eq!(snapshot.get("zookeeper.enabled"), Some("true"));
    }

    #[test]
    fn test_validate_rejects_bad_root_and_empty_path() {
        let mut cfg = DiscoveryAppConfig::default();
        cfg.zookeeper.root = "services".into();
        assert!(matches!(
            cfg.validate(),
            Err(DiscoveryError::ConfigurationInvalid(_))
        ));

        let mut cfg = DiscoveryAppConfig::default();
        cfg.zookeeper.dependencies.insert(
            "broken".into(),
            DependencyConfig {
                path: "/".into(),
                load_balancer: LoadBalancerType::RoundRobin,
                content_type_template: None,
                version: None,
                headers: BTreeMap::new(),
                required: false,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("dependencies.broken.path"));
    }

    #[test]
    fn test_load_directory_layout_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.toml"),
            "[service]\nname = \"base\"\n[zookeeper]\nport = 1\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("services")).unwrap();
        fs::write(
            dir.path().join("services").join("a.toml"),
            "[zookeeper]\nport = 2\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("overrides")).unwrap();
        fs::write(
            dir.path().join("overrides").join("z.toml"),
            "[service]\nname = \"override\"\n",
        )
        .unwrap();

        let cfg = load_config_from_source(dir.path()).unwrap();
        assert_eq!(cfg.service.name, "override");
        assert_eq!(cfg.zookeeper.port, 2);
    }

    #[test]
    fn test_missing_base_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from_source(dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing base configuration"));
    }
}
