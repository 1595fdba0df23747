//! 服务实例模块
//!
//! - `ServiceInstance`：注册到协调服务中的实例描述，注册后不可变
//! - `InstanceTemplate`：实例模板，端口等可变字段保存在这里，每次注册时 `build()` 出新实例
//!
//! 节点数据采用 JSON 编码，字段布局与 Curator `ServiceInstance` 保持一致，
//! 便于与其他语言的客户端互通。

mod uri_spec;

pub use uri_spec::{DEFAULT_URI_SPEC, UriPart, UriSpec};

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DiscoveryAppConfig;
use crate::error::{DiscoveryError, Result};

/// 实例类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// 临时节点，会话结束即消失
    #[default]
    Dynamic,
    /// 静态注册
    Static,
    /// 持久注册
    Permanent,
}

/// 服务实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// 服务名
    #[serde(rename = "name")]
    pub service_id: String,
    /// 实例 ID（节点名）
    #[serde(rename = "id")]
    pub instance_id: String,
    /// 主机地址
    #[serde(rename = "address")]
    pub host: String,
    /// 服务端口
    #[serde(default)]
    pub port: u16,
    /// SSL 端口
    #[serde(default)]
    pub ssl_port: Option<u16>,
    /// 元数据
    #[serde(rename = "payload", default)]
    pub metadata: BTreeMap<String, String>,
    /// 注册时间（UTC 毫秒）
    #[serde(rename = "registrationTimeUTC", default)]
    pub registration_time_utc: i64,
    /// 实例类型
    #[serde(default)]
    pub service_type: ServiceType,
    /// URI 模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_spec: Option<UriSpec>,
}

impl ServiceInstance {
    /// 按 URI 模板生成访问地址，未配置模板时使用默认模板
    pub fn uri(&self) -> String {
        match &self.uri_spec {
            Some(spec) => spec.build(self),
            None => UriSpec::default().build(self),
        }
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 编码为节点数据
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| DiscoveryError::MalformedPayload {
            path: self.instance_id.clone(),
            source,
        })
    }

    /// 从节点数据解码
    pub fn from_payload(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|source| DiscoveryError::MalformedPayload {
            path: path.to_string(),
            source,
        })
    }
}

/// 实例模板
///
/// 实例 ID 在模板创建时生成并保持稳定，端口变更后重新 `build()` 的实例沿用同一 ID。
#[derive(Debug, Clone)]
pub struct InstanceTemplate {
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub ssl_port: Option<u16>,
    pub metadata: BTreeMap<String, String>,
    pub uri_spec: UriSpec,
}

impl InstanceTemplate {
    pub fn new(service_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: Uuid::new_v4().to_string(),
            host: host.into(),
            port,
            ssl_port: None,
            metadata: BTreeMap::new(),
            uri_spec: UriSpec::default(),
        }
    }

    /// 从应用配置构建模板
    pub fn from_config(config: &DiscoveryAppConfig) -> Self {
        let zk = &config.zookeeper;
        let mut template = Self::new(
            config.service.name.clone(),
            zk.instance_host.clone(),
            zk.port,
        )
        .with_ssl_port(zk.ssl_port)
        .with_uri_spec(UriSpec::parse(&zk.uri_spec));

        if let Some(instance_id) = zk.instance_id.as_ref().filter(|id| !id.is_empty()) {
            template.instance_id = instance_id.clone();
        }
        template.metadata = zk.metadata.clone();
        template
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_ssl_port(mut self, ssl_port: Option<u16>) -> Self {
        self.ssl_port = ssl_port;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_uri_spec(mut self, uri_spec: UriSpec) -> Self {
        self.uri_spec = uri_spec;
        self
    }

    /// 生成一个新的不可变实例
    pub fn build(&self) -> ServiceInstance {
        ServiceInstance {
            service_id: self.service_id.clone(),
            instance_id: self.instance_id.clone(),
            host: self.host.clone(),
            port: self.port,
            ssl_port: self.ssl_port,
            metadata: self.metadata.clone(),
            registration_time_utc: Utc::now().timestamp_millis(),
            service_type: ServiceType::Dynamic,
            uri_spec: Some(self.uri_spec.clone()),
        }
    }
}
