//! 协调服务抽象
//!
//! 注册与发现只依赖这里定义的最小能力集：
//! - 创建 / 删除临时节点
//! - 读取子节点并订阅子节点变更
//! - 会话事件（连接挂起、重连、过期）
//!
//! 生产环境接入具体的 Zookeeper 客户端时实现 `CoordinationClient` 即可，
//! `memory` 子模块提供进程内实现，用于测试与本地运行。

pub mod memory;

pub use memory::{Fault, InMemoryCoordinator, InMemoryEnsemble, Operation};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

/// 会话事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// 首次建立连接
    Connected,
    /// 连接挂起，会话可能仍然有效
    Suspended,
    /// 会话内重连成功
    Reconnected,
    /// 会话过期，临时节点与 watch 已被服务端清理
    Expired,
}

/// 协调服务事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationEvent {
    Session(SessionEvent),
    /// 已订阅路径的子节点发生变化
    ChildrenChanged { path: String },
}

/// 子节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    pub name: String,
    pub data: Vec<u8>,
}

/// 协调服务客户端
///
/// 错误约定：
/// - 连接丢失返回 `TransientConnection`
/// - 创建已存在节点返回 `NodeAlreadyExists`，删除不存在节点返回 `NodeNotFound`
/// - 其他拒绝返回 `Coordination`
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// 创建临时节点，父节点不存在时自动创建
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// 删除节点
    async fn delete(&self, path: &str) -> Result<()>;

    /// 读取子节点（按名称排序），父节点不存在时返回空列表
    async fn get_children(&self, path: &str) -> Result<Vec<ChildNode>>;

    /// 订阅子节点变更，重复订阅同一路径是幂等的
    async fn watch_children(&self, path: &str) -> Result<()>;

    /// 订阅事件流
    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent>;
}

/// 拼接注册路径
pub fn join_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let child = child.trim_matches('/');
    if child.is_empty() {
        return if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        };
    }
    format!("{parent}/{child}")
}

/// 取父路径，根路径返回 `None`
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if trimmed.len() <= 1 {
        return None;
    }
    Some(if idx == 0 { "/" } else { &trimmed[..idx] })
}

/// 服务实例在注册中心中的路径：`{root}/{service_id}/{instance_id}`
pub fn instance_path(root: &str, service_id: &str, instance_id: &str) -> String {
    join_path(&join_path(root, service_id), instance_id)
}
