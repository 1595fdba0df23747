//! 服务注册状态机
//!
//! 单个服务实例的注册生命周期：
//!
//! ```text
//! Unregistered --register--> Registering --ok--> Registered --deregister--> Deregistering --> Unregistered
//!                                 |                   |
//!                                 +--fatal--> Failed  +--session expired--> Unregistered (自动重新注册)
//! ```
//!
//! - 所有状态迁移在同一把异步锁内串行执行，并发的 register/deregister 排队而不会交错
//! - 当前状态通过 watch 通道发布，读取不需要加锁
//! - 暂时性错误（连接丢失、超时）只做一次有界重试，之后进入 `Failed` 交由调用方处理

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::coordination::{CoordinationClient, instance_path};
use crate::error::{DiscoveryError, Result};
use crate::instance::ServiceInstance;
use crate::metrics::DISCOVERY_METRICS;

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
    Failed,
}

impl RegistrationState {
    fn gauge_value(self) -> i64 {
        match self {
            RegistrationState::Unregistered => 0,
            RegistrationState::Registering => 1,
            RegistrationState::Registered => 2,
            RegistrationState::Deregistering => 3,
            RegistrationState::Failed => 4,
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "UNREGISTERED",
            RegistrationState::Registering => "REGISTERING",
            RegistrationState::Registered => "REGISTERED",
            RegistrationState::Deregistering => "DEREGISTERING",
            RegistrationState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// 状态机参数
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// 注册根路径
    pub root: String,
    /// 单次协调服务调用超时
    pub operation_timeout: Duration,
    /// 暂时性错误的重试次数
    pub max_transient_retries: u32,
    /// 重试前退避
    pub retry_backoff: Duration,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            root: "/services".to_string(),
            operation_timeout: Duration::from_secs(3),
            max_transient_retries: 1,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

struct Inner {
    state: RegistrationState,
    /// 最近一次请求注册的实例，会话过期后用于重新注册
    instance: Option<ServiceInstance>,
    /// 删除未得到确认的节点路径，下一次创建前必须先清理
    orphan: Option<String>,
}

/// 服务注册状态机
pub struct RegistrationStateMachine {
    client: Arc<dyn CoordinationClient>,
    options: RegistrationOptions,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<RegistrationState>,
}

impl RegistrationStateMachine {
    pub fn new(client: Arc<dyn CoordinationClient>, options: RegistrationOptions) -> Self {
        let (state_tx, _) = watch::channel(RegistrationState::Unregistered);
        DISCOVERY_METRICS
            .registration_state
            .set(RegistrationState::Unregistered.gauge_value());
        Self {
            client,
            options,
            inner: Mutex::new(Inner {
                state: RegistrationState::Unregistered,
                instance: None,
                orphan: None,
            }),
            state_tx,
        }
    }

    /// 当前状态（无锁读取）
    pub fn state(&self) -> RegistrationState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    /// 最近一次请求注册的实例
    pub async fn current_instance(&self) -> Option<ServiceInstance> {
        self.inner.lock().await.instance.clone()
    }

    pub fn options(&self) -> &RegistrationOptions {
        &self.options
    }

    /// 实例节点路径
    pub fn node_path(&self, instance: &ServiceInstance) -> String {
        instance_path(&self.options.root, &instance.service_id, &instance.instance_id)
    }

    /// 注册实例，仅允许从 `Unregistered` 或 `Failed` 发起
    pub async fn register(&self, instance: ServiceInstance) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            RegistrationState::Unregistered | RegistrationState::Failed => {}
            state => {
                return Err(DiscoveryError::IllegalTransition {
                    state,
                    event: "register",
                });
            }
        }
        self.register_locked(&mut inner, instance).await
    }

    /// 注销实例，仅允许从 `Registered` 发起；删除失败只记录日志
    pub async fn deregister(&self) -> Result<()> {
        self.deregister_within(self.options.operation_timeout).await
    }

    /// 在截止时间内注销实例
    ///
    /// 截止时间只约束等待锁与删除调用，状态总会回到 `Unregistered`。
    /// 未确认删除的节点会被记下，下一次注册前先清理。
    pub async fn deregister_within(&self, deadline: Duration) -> Result<()> {
        let mut inner = match tokio::time::timeout(deadline, self.inner.lock()).await {
            Ok(inner) => inner,
            Err(_) => {
                return Err(DiscoveryError::Timeout {
                    operation: "deregister",
                    timeout: deadline,
                });
            }
        };
        if inner.state != RegistrationState::Registered {
            return Err(DiscoveryError::IllegalTransition {
                state: inner.state,
                event: "deregister",
            });
        }
        self.deregister_locked(&mut inner, deadline.min(self.options.operation_timeout))
            .await;
        Ok(())
    }

    /// 会话过期回调
    ///
    /// 服务端已经清理了临时节点；若此前处于 `Registered`，转为 `Unregistered`
    /// 并用原实例数据发起一次重新注册。返回是否发起了重新注册。
    pub async fn on_session_expired(&self) -> Result<bool> {
        DISCOVERY_METRICS.session_expirations_total.inc();
        let mut inner = self.inner.lock().await;
        if inner.state != RegistrationState::Registered {
            debug!(state = %inner.state, "session expired while not registered, nothing to restore");
            return Ok(false);
        }

        self.transition(&mut inner, RegistrationState::Unregistered);
        let Some(instance) = inner.instance.clone() else {
            return Ok(false);
        };

        warn!(
            service_id = %instance.service_id,
            instance_id = %instance.instance_id,
            "coordination session expired, re-registering instance"
        );
        self.register_locked(&mut inner, instance).await?;
        Ok(true)
    }

    /// 修改端口
    ///
    /// 已注册时先注销再以新端口注册，调用返回后注册中心中只存在新端口的实例；
    /// 未注册时只更新记住的实例。
    pub async fn set_port(&self, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.instance.clone() else {
            return Ok(());
        };
        if current.port == port {
            return Ok(());
        }

        let mut updated = current;
        updated.port = port;
        updated.registration_time_utc = Utc::now().timestamp_millis();

        match inner.state {
            RegistrationState::Registered => {
                info!(
                    service_id = %updated.service_id,
                    port,
                    "port changed while registered, re-registering"
                );
                // 旧节点删除失败时 register_locked 会先重试删除，仍失败则进入 Failed
                self.deregister_locked(&mut inner, self.options.operation_timeout)
                    .await;
                self.register_locked(&mut inner, updated).await
            }
            _ => {
                inner.instance = Some(updated);
                Ok(())
            }
        }
    }

    async fn register_locked(&self, inner: &mut Inner, instance: ServiceInstance) -> Result<()> {
        let path = self.node_path(&instance);
        inner.instance = Some(instance.clone());
        self.transition(inner, RegistrationState::Registering);

        if let Err(err) = self.clear_orphan(inner).await {
            DISCOVERY_METRICS
                .registration_attempts_total
                .with_label_values(&[err.kind()])
                .inc();
            self.transition(inner, RegistrationState::Failed);
            error!(
                path = %path,
                error = %err,
                "❌ Previous instance node could not be removed, registration aborted"
            );
            return Err(err);
        }

        let payload = match instance.to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                self.transition(inner, RegistrationState::Failed);
                return Err(err);
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .bounded(
                    "create",
                    self.options.operation_timeout,
                    self.client.create_ephemeral(&path, payload.clone()),
                )
                .await;

            match result {
                Ok(()) | Err(DiscoveryError::NodeAlreadyExists(_)) => {
                    DISCOVERY_METRICS
                        .registration_attempts_total
                        .with_label_values(&["success"])
                        .inc();
                    self.transition(inner, RegistrationState::Registered);
                    info!(
                        service_id = %instance.service_id,
                        instance_id = %instance.instance_id,
                        address = %instance.authority(),
                        path = %path,
                        "✅ Service instance registered"
                    );
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt <= self.options.max_transient_retries => {
                    DISCOVERY_METRICS
                        .registration_attempts_total
                        .with_label_values(&["retry"])
                        .inc();
                    warn!(
                        path = %path,
                        attempt,
                        error = %err,
                        "transient error while registering, retrying"
                    );
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                Err(err) => {
                    DISCOVERY_METRICS
                        .registration_attempts_total
                        .with_label_values(&[err.kind()])
                        .inc();
                    self.transition(inner, RegistrationState::Failed);
                    error!(
                        path = %path,
                        attempt,
                        error = %err,
                        "❌ Service registration failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// 删除上一次未确认删除的节点
    async fn clear_orphan(&self, inner: &mut Inner) -> Result<()> {
        let Some(path) = inner.orphan.clone() else {
            return Ok(());
        };
        let timeout = self.options.operation_timeout;
        match self.bounded("delete", timeout, self.client.delete(&path)).await {
            Ok(()) | Err(DiscoveryError::NodeNotFound(_)) => {
                debug!(path = %path, "stale instance node cleared");
                inner.orphan = None;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn deregister_locked(&self, inner: &mut Inner, timeout: Duration) {
        self.transition(inner, RegistrationState::Deregistering);
        let Some(path) = inner.instance.as_ref().map(|i| self.node_path(i)) else {
            self.transition(inner, RegistrationState::Unregistered);
            return;
        };

        match self.bounded("delete", timeout, self.client.delete(&path)).await {
            Ok(()) => {
                DISCOVERY_METRICS
                    .deregistrations_total
                    .with_label_values(&["deleted"])
                    .inc();
                info!(path = %path, "Service instance deregistered");
            }
            Err(DiscoveryError::NodeNotFound(_)) => {
                DISCOVERY_METRICS
                    .deregistrations_total
                    .with_label_values(&["absent"])
                    .inc();
                debug!(path = %path, "instance node already absent");
            }
            Err(err) => {
                DISCOVERY_METRICS
                    .deregistrations_total
                    .with_label_values(&["error"])
                    .inc();
                warn!(
                    path = %path,
                    error = %err,
                    "failed to delete instance node, will retry before next registration"
                );
                inner.orphan = Some(path);
            }
        }
        self.transition(inner, RegistrationState::Unregistered);
    }

    async fn bounded<F>(&self, operation: &'static str, timeout: Duration, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout { operation, timeout }),
        }
    }

    fn transition(&self, inner: &mut Inner, next: RegistrationState) {
        if inner.state != next {
            debug!(from = %inner.state, to = %next, "registration state transition");
        }
        inner.state = next;
        DISCOVERY_METRICS.registration_state.set(next.gauge_value());
        self.state_tx.send_replace(next);
    }
}
