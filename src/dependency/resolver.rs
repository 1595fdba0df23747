//! 依赖解析器
//!
//! 每个依赖路径维护一个子节点 watch，刷新时重新读取子节点、构造新的实例列表，
//! 并通过 `ArcSwap` 整体替换，读者不加锁，也不会看到构造到一半的列表。
//! 连接异常时保留最后一次成功的列表并标记为过期。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{DependencyDescriptor, LoadBalancer};
use crate::config::ZookeeperConfig;
use crate::coordination::{CoordinationClient, join_path};
use crate::error::{DiscoveryError, Result};
use crate::instance::ServiceInstance;
use crate::metrics::DISCOVERY_METRICS;

/// 某个依赖的端点快照
#[derive(Debug, Clone, Default)]
pub struct EndpointSnapshot {
    /// 按实例 ID 排序、去重后的实例
    pub instances: Vec<ServiceInstance>,
    /// 最近一次刷新失败或连接挂起
    pub stale: bool,
    /// 最近一次成功刷新的时间
    pub refreshed_at: Option<DateTime<Utc>>,
}

struct DependencyEntry {
    descriptor: DependencyDescriptor,
    balancer: LoadBalancer,
    endpoints: ArcSwap<EndpointSnapshot>,
}

impl DependencyEntry {
    fn publish(&self, snapshot: EndpointSnapshot) {
        let service = self.descriptor.service_name.as_str();
        DISCOVERY_METRICS
            .resolved_endpoints
            .with_label_values(&[service])
            .set(snapshot.instances.len() as i64);
        DISCOVERY_METRICS
            .dependency_stale
            .with_label_values(&[service])
            .set(i64::from(snapshot.stale));
        self.endpoints.store(Arc::new(snapshot));
    }

    fn mark_stale(&self) {
        let current = self.endpoints.load_full();
        if current.stale {
            return;
        }
        self.publish(EndpointSnapshot {
            stale: true,
            ..(*current).clone()
        });
    }
}

/// 依赖解析器
pub struct DependencyResolver {
    client: Arc<dyn CoordinationClient>,
    entries: HashMap<String, DependencyEntry>,
    /// 路径 -> 依赖名（多个依赖可以指向同一路径）
    by_path: BTreeMap<String, Vec<String>>,
    operation_timeout: Duration,
}

impl DependencyResolver {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        descriptors: Vec<DependencyDescriptor>,
        operation_timeout: Duration,
    ) -> Self {
        let mut entries = HashMap::new();
        let mut by_path: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for descriptor in descriptors {
            by_path
                .entry(descriptor.coordination_path.clone())
                .or_default()
                .push(descriptor.service_name.clone());
            entries.insert(
                descriptor.service_name.clone(),
                DependencyEntry {
                    balancer: LoadBalancer::new(descriptor.load_balancer),
                    endpoints: ArcSwap::from_pointee(EndpointSnapshot {
                        stale: true,
                        ..EndpointSnapshot::default()
                    }),
                    descriptor,
                },
            );
        }
        Self {
            client,
            entries,
            by_path,
            operation_timeout,
        }
    }

    pub fn from_config(client: Arc<dyn CoordinationClient>, config: &ZookeeperConfig) -> Self {
        Self::new(
            client,
            DependencyDescriptor::from_zookeeper_config(config),
            config.operation_timeout(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 已声明的依赖名（排序）
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptor(&self, service_name: &str) -> Result<&DependencyDescriptor> {
        self.entry(service_name).map(|e| &e.descriptor)
    }

    /// 是否监听了该路径
    pub fn watches(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// 订阅全部依赖路径并做首次刷新；单个路径失败只记录日志并标记过期
    pub async fn start(&self) {
        for path in self.by_path.keys() {
            if let Err(err) = self
                .bounded("watch_children", self.client.watch_children(path))
                .await
            {
                warn!(path = %path, error = %err, "failed to watch dependency path");
                self.mark_path_stale(path);
                continue;
            }
            if let Err(err) = self.refresh_path(path).await {
                warn!(path = %path, error = %err, "initial dependency refresh failed");
            }
        }
        info!(dependencies = self.entries.len(), "dependency resolver started");
    }

    /// 按负载均衡策略返回依赖实例
    pub async fn resolve(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let entry = self.entry(service_name)?;
        let snapshot = entry.endpoints.load();
        Ok(entry.balancer.order(&snapshot.instances))
    }

    /// 按策略选出一个实例，没有可用实例时返回 `None`
    pub async fn resolve_one(&self, service_name: &str) -> Result<Option<ServiceInstance>> {
        Ok(self.resolve(service_name).await?.into_iter().next())
    }

    /// 当前端点快照
    pub fn snapshot(&self, service_name: &str) -> Result<Arc<EndpointSnapshot>> {
        Ok(self.entry(service_name)?.endpoints.load_full())
    }

    pub fn is_stale(&self, service_name: &str) -> Result<bool> {
        Ok(self.entry(service_name)?.endpoints.load().stale)
    }

    /// 重新读取路径下的子节点并替换对应依赖的实例列表
    pub async fn refresh_path(&self, path: &str) -> Result<()> {
        let Some(names) = self.by_path.get(path) else {
            debug!(path = %path, "ignoring refresh for unwatched path");
            return Ok(());
        };

        let children = match self
            .bounded("get_children", self.client.get_children(path))
            .await
        {
            Ok(children) => children,
            Err(err) => {
                for name in names {
                    DISCOVERY_METRICS
                        .endpoint_refresh_total
                        .with_label_values(&[name.as_str(), "error"])
                        .inc();
                }
                self.mark_path_stale(path);
                return Err(err);
            }
        };

        let mut seen = HashSet::new();
        let mut instances = Vec::with_capacity(children.len());
        for child in children {
            let child_path = join_path(path, &child.name);
            match ServiceInstance::from_payload(&child_path, &child.data) {
                Ok(instance) => {
                    if seen.insert(instance.instance_id.clone()) {
                        instances.push(instance);
                    }
                }
                Err(err) => {
                    warn!(path = %child_path, error = %err, "skipping malformed instance node");
                }
            }
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let refreshed_at = Utc::now();
        for name in names {
            if let Some(entry) = self.entries.get(name) {
                entry.publish(EndpointSnapshot {
                    instances: instances.clone(),
                    stale: false,
                    refreshed_at: Some(refreshed_at),
                });
                DISCOVERY_METRICS
                    .endpoint_refresh_total
                    .with_label_values(&[name.as_str(), "success"])
                    .inc();
            }
        }
        debug!(path = %path, instances = instances.len(), "dependency endpoints refreshed");
        Ok(())
    }

    /// 刷新全部路径，失败只记录日志
    pub async fn refresh_all(&self) {
        for path in self.by_path.keys() {
            if let Err(err) = self.refresh_path(path).await {
                warn!(path = %path, error = %err, "dependency refresh failed, serving stale endpoints");
            }
        }
    }

    /// 连接挂起时标记全部依赖为过期，保留已解析的实例
    pub fn mark_stale(&self) {
        for entry in self.entries.values() {
            entry.mark_stale();
        }
    }

    /// 校验必需依赖至少有一个可用实例
    pub fn verify_required(&self) -> Result<()> {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        for name in names {
            let entry = &self.entries[name];
            if entry.descriptor.required && entry.endpoints.load().instances.is_empty() {
                return Err(DiscoveryError::RequiredDependencyUnavailable(name.clone()));
            }
        }
        Ok(())
    }

    fn mark_path_stale(&self, path: &str) {
        if let Some(names) = self.by_path.get(path) {
            for name in names {
                if let Some(entry) = self.entries.get(name) {
                    entry.mark_stale();
                }
            }
        }
    }

    fn entry(&self, service_name: &str) -> Result<&DependencyEntry> {
        self.entries
            .get(service_name)
            .ok_or_else(|| DiscoveryError::UnknownDependency(service_name.to_string()))
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.operation_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout { operation, timeout }),
        }
    }
}
