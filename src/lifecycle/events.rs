//! 协调服务事件泵
//!
//! 后台任务独占协调服务的事件流，也是依赖端点的唯一写入方：
//! - 启动：订阅依赖路径并完成首次刷新
//! - 会话过期：另起任务重新注册，并重新订阅、刷新依赖
//! - 连接挂起：依赖标记为过期，继续提供最后一次成功的端点
//! - 重连：刷新全部依赖
//! - 子节点变更：刷新对应路径

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordination::{CoordinationClient, CoordinationEvent, SessionEvent};
use crate::dependency::DependencyResolver;
use crate::registration::RegistrationStateMachine;

/// 事件泵句柄
pub struct EventPumpHandle {
    shutdown: Option<oneshot::Sender<()>>,
    ready: Option<oneshot::Receiver<()>>,
    join: JoinHandle<()>,
}

impl EventPumpHandle {
    /// 等待首次依赖订阅与刷新完成
    pub async fn ready(&mut self) {
        if let Some(rx) = self.ready.take() {
            let _ = rx.await;
        }
    }

    /// 通知事件泵退出并等待其结束
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            warn!(error = %err, "event pump task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// 事件泵
pub struct EventPump {
    registration: Arc<RegistrationStateMachine>,
    resolver: Option<Arc<DependencyResolver>>,
}

impl EventPump {
    /// 启动事件泵；返回前已完成事件订阅，之后发生的事件不会丢失
    pub fn spawn(
        client: &Arc<dyn CoordinationClient>,
        registration: Arc<RegistrationStateMachine>,
        resolver: Option<Arc<DependencyResolver>>,
    ) -> EventPumpHandle {
        let events = client.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let pump = Self {
            registration,
            resolver,
        };
        let join = tokio::spawn(pump.run(events, ready_tx, shutdown_rx));
        EventPumpHandle {
            shutdown: Some(shutdown_tx),
            ready: Some(ready_rx),
            join,
        }
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<CoordinationEvent>,
        ready: oneshot::Sender<()>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        debug!("coordination event pump started");
        // 首次刷新期间到达的事件留在接收端，之后按序处理
        if let Some(resolver) = &self.resolver {
            resolver.start().await;
        }
        let _ = ready.send(());

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = events.recv() => match received {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event pump lagged behind, refreshing all dependencies");
                        if let Some(resolver) = &self.resolver {
                            resolver.refresh_all().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("coordination event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("coordination event pump stopped");
    }

    async fn handle(&self, event: CoordinationEvent) {
        match event {
            CoordinationEvent::Session(SessionEvent::Expired) => {
                warn!("coordination session expired");
                let registration = self.registration.clone();
                tokio::spawn(async move {
                    if let Err(err) = registration.on_session_expired().await {
                        error!(error = %err, "re-registration after session expiry failed");
                    }
                });
                // watch 随会话一起失效，需要重新订阅
                if let Some(resolver) = &self.resolver {
                    resolver.start().await;
                }
            }
            CoordinationEvent::Session(SessionEvent::Suspended) => {
                warn!("coordination connection suspended, serving stale endpoints");
                if let Some(resolver) = &self.resolver {
                    resolver.mark_stale();
                }
            }
            CoordinationEvent::Session(SessionEvent::Reconnected | SessionEvent::Connected) => {
                info!("coordination connection (re)established");
                if let Some(resolver) = &self.resolver {
                    resolver.refresh_all().await;
                }
            }
            CoordinationEvent::ChildrenChanged { path } => {
                if let Some(resolver) = &self.resolver {
                    if !resolver.watches(&path) {
                        return;
                    }
                    if let Err(err) = resolver.refresh_path(&path).await {
                        warn!(path = %path, error = %err, "failed to refresh dependency after watch fired");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::coordination::memory::InMemoryEnsemble;
    use crate::dependency::{DependencyDescriptor, LoadBalancerType};
    use crate::instance::InstanceTemplate;
    use crate::registration::{RegistrationOptions, RegistrationState};

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_pump_follows_watch_and_session_events() {
        let ensemble = InMemoryEnsemble::new();
        let memory = ensemble.connect();
        let client: Arc<dyn CoordinationClient> = memory.clone();

        let registration = Arc::new(RegistrationStateMachine::new(
            client.clone(),
            RegistrationOptions::default(),
        ));
        let resolver = Arc::new(DependencyResolver::new(
            client.clone(),
            vec![DependencyDescriptor {
                service_name: "mail".to_string(),
                coordination_path: "/services/mail".to_string(),
                load_balancer: LoadBalancerType::RoundRobin,
                content_type_template: None,
                version: None,
                headers: BTreeMap::new(),
                required: false,
            }],
            Duration::from_secs(1),
        ));

        let mut handle = EventPump::spawn(&client, registration.clone(), Some(resolver.clone()));
        handle.ready().await;
        assert_eq!(memory.watched_paths(), vec!["/services/mail".to_string()]);
        assert!(!resolver.is_stale("mail").unwrap());
        registration
            .register(
                InstanceTemplate::new("billing", "10.0.0.1", 8080)
                    .with_instance_id("b-1")
                    .build(),
            )
            .await
            .unwrap();

        let provider = ensemble.connect();
        let mail = InstanceTemplate::new("mail", "10.0.0.2", 25)
            .with_instance_id("m-1")
            .build();
        provider
            .create_ephemeral("/services/mail/m-1", mail.to_payload().unwrap())
            .await
            .unwrap();
        wait_until(|| resolver.snapshot("mail").unwrap().instances.len() == 1).await;

        memory.suspend();
        wait_until(|| resolver.is_stale("mail").unwrap()).await;
        assert_eq!(resolver.snapshot("mail").unwrap().instances.len(), 1);

        memory.reconnect();
        wait_until(|| !resolver.is_stale("mail").unwrap()).await;

        memory.expire_session();
        wait_until(|| {
            memory.create_calls() == 2 && registration.state() == RegistrationState::Registered
        })
        .await;
        assert!(ensemble.exists("/services/billing/b-1"));
        wait_until(|| memory.watched_paths() == vec!["/services/mail".to_string()]).await;

        handle.shutdown().await;
    }
}
