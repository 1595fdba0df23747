//! 进程内协调服务
//!
//! `InMemoryEnsemble` 模拟一个协调服务集群，`InMemoryCoordinator` 是连接到它的一个会话：
//! - 临时节点归属创建它的会话，会话过期或关闭时被清理
//! - 子节点 watch 是持久的，只推送给已订阅且处于连接状态的客户端
//! - 支持挂起 / 重连 / 过期会话、注入故障、卡住调用，便于覆盖异常路径

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChildNode, CoordinationClient, CoordinationEvent, SessionEvent, parent_path};
use crate::error::{DiscoveryError, Result};

const EVENT_CAPACITY: usize = 256;

/// 注入的故障类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// 连接丢失（暂时性）
    ConnectionLoss,
    /// 服务端拒绝（致命）
    Rejected,
}

impl Fault {
    fn into_error(self, path: &str) -> DiscoveryError {
        match self {
            Fault::ConnectionLoss => {
                DiscoveryError::TransientConnection(format!("connection loss on {path}"))
            }
            Fault::Rejected => DiscoveryError::Coordination(format!("request rejected on {path}")),
        }
    }
}

/// 可注入故障的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Delete,
    GetChildren,
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<u64>,
}

struct ClientSlot {
    session_id: u64,
    connected: bool,
    watches: HashSet<String>,
    tx: broadcast::Sender<CoordinationEvent>,
}

#[derive(Default)]
struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    clients: HashMap<u64, ClientSlot>,
}

impl EnsembleState {
    fn notify_children_changed(&self, parent: &str) {
        for slot in self.clients.values() {
            if slot.connected && slot.watches.contains(parent) {
                let _ = slot.tx.send(CoordinationEvent::ChildrenChanged {
                    path: parent.to_string(),
                });
            }
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_path(path);
        while let Some(parent) = current {
            if parent == "/" || self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_path(parent);
        }
        for parent in missing.into_iter().rev() {
            self.nodes.insert(
                parent.clone(),
                Node {
                    data: Vec::new(),
                    owner: None,
                },
            );
            if let Some(grandparent) = parent_path(&parent) {
                self.notify_children_changed(grandparent);
            }
        }
    }

    fn children(&self, path: &str) -> Vec<(String, &Node)> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, node)| {
                let name = &key[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| (name.to_string(), node))
            })
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        !self.children(path).is_empty()
    }
}

/// 进程内协调服务集群
#[derive(Clone, Default)]
pub struct InMemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立一个新会话
    pub fn connect(&self) -> Arc<InMemoryCoordinator> {
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);

        self.state.lock().clients.insert(
            client_id,
            ClientSlot {
                session_id,
                connected: true,
                watches: HashSet::new(),
                tx: tx.clone(),
            },
        );

        Arc::new(InMemoryCoordinator {
            client_id,
            ensemble: self.clone(),
            tx,
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            faults: Mutex::new(HashMap::new()),
        })
    }

    /// 写入持久节点（模拟其他进程的注册）
    pub fn put_persistent(&self, path: &str, data: Vec<u8>) {
        let mut state = self.state.lock();
        state.ensure_parents(path);
        state
            .nodes
            .insert(path.to_string(), Node { data, owner: None });
        if let Some(parent) = parent_path(path) {
            state.notify_children_changed(parent);
        }
    }

    /// 删除节点，返回节点是否存在
    pub fn remove(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.nodes.remove(path).is_some();
        if removed {
            if let Some(parent) = parent_path(path) {
                state.notify_children_changed(parent);
            }
        }
        removed
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().nodes.get(path).map(|n| n.data.clone())
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .children(path)
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }
}

/// 进程内协调服务会话
pub struct InMemoryCoordinator {
    client_id: u64,
    ensemble: InMemoryEnsemble,
    tx: broadcast::Sender<CoordinationEvent>,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    stalled: AtomicBool,
    faults: Mutex<HashMap<Operation, VecDeque<Fault>>>,
}

impl InMemoryCoordinator {
    /// 已发起的创建调用次数（含失败）
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// 已发起的删除调用次数（含失败）
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// 为后续调用排队注入故障，每次调用消耗一个
    pub fn inject_faults(&self, operation: Operation, faults: impl IntoIterator<Item = Fault>) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .extend(faults);
    }

    /// 当前会话订阅的路径（排序）
    pub fn watched_paths(&self) -> Vec<String> {
        let state = self.ensemble.state.lock();
        let mut paths: Vec<String> = state
            .clients
            .get(&self.client_id)
            .map(|slot| slot.watches.iter().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// 卡住所有调用，模拟无响应的协调服务
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// 连接挂起
    pub fn suspend(&self) {
        let mut state = self.ensemble.state.lock();
        if let Some(slot) = state.clients.get_mut(&self.client_id) {
            slot.connected = false;
        }
        let _ = self.tx.send(CoordinationEvent::Session(SessionEvent::Suspended));
    }

    /// 会话内重连
    pub fn reconnect(&self) {
        let mut state = self.ensemble.state.lock();
        if let Some(slot) = state.clients.get_mut(&self.client_id) {
            slot.connected = true;
        }
        let _ = self.tx.send(CoordinationEvent::Session(SessionEvent::Reconnected));
    }

    /// 会话过期：清理本会话的临时节点，随后以新会话恢复连接
    pub fn expire_session(&self) {
        let mut state = self.ensemble.state.lock();
        let new_session = self.ensemble.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(old_session) = state.clients.get_mut(&self.client_id).map(|slot| {
            let old = slot.session_id;
            slot.session_id = new_session;
            slot.connected = true;
            // 会话过期时服务端同时丢弃 watch
            slot.watches.clear();
            old
        }) else {
            return;
        };

        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(old_session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            state.nodes.remove(path);
            if let Some(parent) = parent_path(path) {
                state.notify_children_changed(parent);
            }
        }
        debug!(removed = owned.len(), "in-memory session expired");

        let _ = self.tx.send(CoordinationEvent::Session(SessionEvent::Expired));
    }

    /// 关闭会话并清理临时节点
    pub fn close(&self) {
        let mut state = self.ensemble.state.lock();
        let Some(slot) = state.clients.remove(&self.client_id) else {
            return;
        };
        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(slot.session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            state.nodes.remove(&path);
            if let Some(parent) = parent_path(&path) {
                state.notify_children_changed(parent);
            }
        }
    }

    async fn before_call(&self, operation: Operation, path: &str) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let fault = self
            .faults
            .lock()
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(fault) => Err(fault.into_error(path)),
            None => Ok(()),
        }
    }

    fn connected_session(&self, state: &EnsembleState, path: &str) -> Result<u64> {
        match state.clients.get(&self.client_id) {
            Some(slot) if slot.connected => Ok(slot.session_id),
            Some(_) => Err(DiscoveryError::TransientConnection(format!(
                "connection suspended while accessing {path}"
            ))),
            None => Err(DiscoveryError::Coordination("session closed".to_string())),
        }
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordinator {
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(Operation::Create, path).await?;

        let mut state = self.ensemble.state.lock();
        let session_id = self.connected_session(&state, path)?;
        if state.nodes.contains_key(path) {
            return Err(DiscoveryError::NodeAlreadyExists(path.to_string()));
        }
        state.ensure_parents(path);
        state.nodes.insert(
            path.to_string(),
            Node {
                data,
                owner: Some(session_id),
            },
        );
        if let Some(parent) = parent_path(path) {
            state.notify_children_changed(parent);
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call(Operation::Delete, path).await?;

        let mut state = self.ensemble.state.lock();
        self.connected_session(&state, path)?;
        if !state.nodes.contains_key(path) {
            return Err(DiscoveryError::NodeNotFound(path.to_string()));
        }
        if state.has_children(path) {
            return Err(DiscoveryError::Coordination(format!("node not empty: {path}")));
        }
        state.nodes.remove(path);
        if let Some(parent) = parent_path(path) {
            state.notify_children_changed(parent);
        }
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<ChildNode>> {
        self.before_call(Operation::GetChildren, path).await?;

        let state = self.ensemble.state.lock();
        self.connected_session(&state, path)?;
        Ok(state
            .children(path)
            .into_iter()
            .map(|(name, node)| ChildNode {
                name,
                data: node.data.clone(),
            })
            .collect())
    }

    async fn watch_children(&self, path: &str) -> Result<()> {
        let mut state = self.ensemble.state.lock();
        self.connected_session(&state, path)?;
        if let Some(slot) = state.clients.get_mut(&self.client_id) {
            slot.watches.insert(path.to_string());
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.tx.subscribe()
    }
}
