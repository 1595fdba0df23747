//! 依赖声明

use std::collections::BTreeMap;

use crate::config::{DependencyConfig, ZookeeperConfig};
use crate::coordination::join_path;
use crate::dependency::LoadBalancerType;

const VERSION_PLACEHOLDER: &str = "$version";

/// 依赖描述，启动时从配置加载，之后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDescriptor {
    /// 依赖名（配置中的键）
    pub service_name: String,
    /// 注册中心中的完整路径
    pub coordination_path: String,
    pub load_balancer: LoadBalancerType,
    pub content_type_template: Option<String>,
    pub version: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// 启动时必须至少有一个可用实例
    pub required: bool,
}

impl DependencyDescriptor {
    /// 依赖路径总是相对于注册根路径
    pub fn from_config(root: &str, service_name: &str, config: &DependencyConfig) -> Self {
        Self {
            service_name: service_name.to_string(),
            coordination_path: join_path(root, &config.path),
            load_balancer: config.load_balancer,
            content_type_template: config.content_type_template.clone(),
            version: config.version.clone(),
            headers: config.headers.clone(),
            required: config.required,
        }
    }

    /// 从 `[zookeeper.dependencies]` 构造全部依赖描述
    pub fn from_zookeeper_config(config: &ZookeeperConfig) -> Vec<Self> {
        config
            .dependencies
            .iter()
            .map(|(name, dependency)| Self::from_config(&config.root, name, dependency))
            .collect()
    }

    /// 调用依赖时使用的 Content-Type，模板中的 `$version` 替换为版本号
    pub fn content_type(&self) -> Option<String> {
        let template = self.content_type_template.as_ref()?;
        Some(match &self.version {
            Some(version) => template.replace(VERSION_PLACEHOLDER, version),
            None => template.clone(),
        })
    }
}
