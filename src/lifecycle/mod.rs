//! 服务生命周期编排
//!
//! 把宿主进程的启动 / 停止事件桥接到注册状态机与依赖解析器：
//! - `on_start()`：启动事件泵与依赖解析，校验必需依赖，注册实例
//! - `on_stop()`：在截止时间内注销实例，超时只记录日志
//! - 启动期失败默认终止启动（`fail_fast`），可配置为记录日志后继续

mod events;

pub use events::{EventPump, EventPumpHandle};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::activation::ActivationPredicate;
use crate::config::{DiscoveryAppConfig, ZookeeperConfig};
use crate::coordination::CoordinationClient;
use crate::dependency::DependencyResolver;
use crate::error::{DiscoveryError, Result};
use crate::instance::{InstanceTemplate, ServiceInstance};
use crate::registration::{RegistrationOptions, RegistrationState, RegistrationStateMachine};

/// 生命周期钩子
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// 以当前模板注册实例
    async fn register(&self) -> Result<()>;

    /// 注销实例
    async fn deregister(&self) -> Result<()>;

    /// 是否启用服务注册
    fn is_enabled(&self) -> bool;

    /// 当前配置的端口
    fn configured_port(&self) -> u16;

    /// 修改端口；已注册时以新端口重新注册
    async fn set_configured_port(&self, port: u16) -> Result<()>;
}

/// 生命周期编排器
pub struct LifecycleOrchestrator {
    config: ZookeeperConfig,
    client: Arc<dyn CoordinationClient>,
    template: Mutex<InstanceTemplate>,
    registration: Arc<RegistrationStateMachine>,
    resolver: Option<Arc<DependencyResolver>>,
    running: AtomicBool,
    pump: tokio::sync::Mutex<Option<EventPumpHandle>>,
}

impl LifecycleOrchestrator {
    /// 校验配置并构建编排器；声明了依赖时才创建依赖解析器
    pub fn new(config: &DiscoveryAppConfig, client: Arc<dyn CoordinationClient>) -> Result<Self> {
        config.validate()?;
        let zk = config.zookeeper.clone();

        let registration = Arc::new(RegistrationStateMachine::new(
            client.clone(),
            RegistrationOptions {
                root: zk.root.clone(),
                operation_timeout: zk.operation_timeout(),
                retry_backoff: zk.retry_backoff(),
                ..RegistrationOptions::default()
            },
        ));

        let outcome = ActivationPredicate::default().evaluate(&config.snapshot().namespace("zookeeper"));
        info!(matched = outcome.matched, "{}", outcome.message);
        let resolver = outcome
            .matched
            .then(|| Arc::new(DependencyResolver::from_config(client.clone(), &zk)));

        Ok(Self {
            template: Mutex::new(InstanceTemplate::from_config(config)),
            config: zk,
            client,
            registration,
            resolver,
            running: AtomicBool::new(false),
            pump: tokio::sync::Mutex::new(None),
        })
    }

    pub fn registration(&self) -> &Arc<RegistrationStateMachine> {
        &self.registration
    }

    pub fn resolver(&self) -> Option<&Arc<DependencyResolver>> {
        self.resolver.as_ref()
    }

    pub fn state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 当前模板生成的实例
    pub fn instance(&self) -> ServiceInstance {
        self.template.lock().build()
    }

    /// 解析依赖；未声明任何依赖时同样返回 `UnknownDependency`
    pub async fn resolve(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        match &self.resolver {
            Some(resolver) => resolver.resolve(service_name).await,
            None => Err(DiscoveryError::UnknownDependency(service_name.to_string())),
        }
    }

    /// 宿主启动
    pub async fn on_start(&self) -> Result<()> {
        if !self.is_enabled() {
            debug!("service registration disabled");
            return Ok(());
        }
        if self.configured_port() == 0 {
            info!("service port not yet known, registration deferred");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // 事件泵负责依赖的首次订阅与刷新，返回时首次刷新已完成
        self.start_pump().await;

        if let Some(resolver) = &self.resolver {
            if let Err(err) = resolver.verify_required() {
                self.fail_or_continue(err).await?;
            }
        }

        if let Err(err) = self.register().await {
            self.fail_or_continue(err).await?;
        }
        Ok(())
    }

    /// 宿主停止
    pub async fn on_stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let deadline = self.config.shutdown_deadline();
        match self.registration.deregister_within(deadline).await {
            Ok(()) => {}
            Err(DiscoveryError::IllegalTransition { state, .. }) => {
                debug!(state = %state, "instance not registered, nothing to deregister");
            }
            Err(err) => warn!(
                deadline = ?deadline,
                error = %err,
                "deregistration did not finish within shutdown deadline, continuing shutdown"
            ),
        }

        self.stop_pump().await;
        info!("service lifecycle stopped");
    }

    async fn fail_or_continue(&self, err: DiscoveryError) -> Result<()> {
        if self.config.fail_fast {
            error!(error = %err, "service startup failed");
            self.running.store(false, Ordering::SeqCst);
            self.stop_pump().await;
            return Err(DiscoveryError::RegistrationFailed(Box::new(err)));
        }
        warn!(error = %err, "service startup problem ignored (fail_fast = false)");
        Ok(())
    }

    async fn start_pump(&self) {
        let mut pump = self.pump.lock().await;
        if pump.is_none() {
            let mut handle = EventPump::spawn(
                &self.client,
                self.registration.clone(),
                self.resolver.clone(),
            );
            handle.ready().await;
            *pump = Some(handle);
        }
    }

    async fn stop_pump(&self) {
        let handle = self.pump.lock().await.take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

#[async_trait]
impl Lifecycle for LifecycleOrchestrator {
    async fn register(&self) -> Result<()> {
        let instance = self.instance();
        self.registration.register(instance).await
    }

    async fn deregister(&self) -> Result<()> {
        self.registration.deregister().await
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn configured_port(&self) -> u16 {
        self.template.lock().port
    }

    async fn set_configured_port(&self, port: u16) -> Result<()> {
        self.template.lock().port = port;
        self.registration.set_port(port).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::config::DependencyConfig;
    use crate::coordination::memory::{Fault, InMemoryCoordinator, InMemoryEnsemble, Operation};

    fn config(port: u16) -> DiscoveryAppConfig {
        let mut config = DiscoveryAppConfig::default();
        config.service.name = "billing".to_string();
        config.zookeeper.port = port;
        config.zookeeper.instance_id = Some("b-1".to_string());
        config.zookeeper.retry_backoff_ms = 1;
        config
    }

    fn with_dependency(mut config: DiscoveryAppConfig, required: bool) -> DiscoveryAppConfig {
        config.zookeeper.dependencies = BTreeMap::from([(
            "mail".to_string(),
            DependencyConfig {
                path: "/mail".to_string(),
                load_balancer: Default::default(),
                content_type_template: None,
                version: None,
                headers: BTreeMap::new(),
                required,
            },
        )]);
        config
    }

    fn build(
        config: &DiscoveryAppConfig,
    ) -> (InMemoryEnsemble, Arc<InMemoryCoordinator>, LifecycleOrchestrator) {
        let ensemble = InMemoryEnsemble::new();
        let client = ensemble.connect();
        let orchestrator = LifecycleOrchestrator::new(config, client.clone()).unwrap();
        (ensemble, client, orchestrator)
    }

    const NODE: &str = "/services/billing/b-1";

    #[tokio::test]
    async fn test_start_registers_and_stop_deregisters() {
        let (ensemble, _client, orchestrator) = build(&config(8080));
        assert!(orchestrator.resolver().is_none());

        orchestrator.on_start().await.unwrap();
        assert!(orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Registered);
        assert!(ensemble.exists(NODE));

        orchestrator.on_stop().await;
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Unregistered);
        assert!(!ensemble.exists(NODE));
    }

    #[tokio::test]
    async fn test_start_is_noop_when_disabled_or_port_unknown() {
        let mut disabled = config(8080);
        disabled.zookeeper.enabled = false;
        let (_ensemble, client, orchestrator) = build(&disabled);
        orchestrator.on_start().await.unwrap();
        assert!(!orchestrator.is_running());
        assert_eq!(client.create_calls(), 0);

        let (_ensemble, client, orchestrator) = build(&config(0));
        orchestrator.on_start().await.unwrap();
        assert!(!orchestrator.is_running());
        assert_eq!(client.create_calls(), 0);

        orchestrator.set_configured_port(8080).await.unwrap();
        orchestrator.on_start().await.unwrap();
        assert_eq!(orchestrator.state(), RegistrationState::Registered);

        // 重复启动不会再次注册
        orchestrator.on_start().await.unwrap();
        assert_eq!(client.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_is_fatal_by_default() {
        let (_ensemble, client, orchestrator) = build(&config(8080));
        client.inject_faults(Operation::Create, [Fault::Rejected]);

        let err = orchestrator.on_start().await.unwrap_err();
        assert!(matches!(err, DiscoveryError::RegistrationFailed(_)));
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Failed);
    }

    #[tokio::test]
    async fn test_registration_failure_tolerated_when_configured() {
        let mut tolerant = config(8080);
        tolerant.zookeeper.fail_fast = false;
        let (_ensemble, client, orchestrator) = build(&tolerant);
        client.inject_faults(Operation::Create, [Fault::Rejected]);

        orchestrator.on_start().await.unwrap();
        assert!(orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Failed);

        // 未注册时停止不会报错
        orchestrator.on_stop().await;
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_missing_required_dependency_blocks_startup() {
        let (_ensemble, client, orchestrator) = build(&with_dependency(config(8080), true));
        assert!(orchestrator.resolver().is_some());

        let err = orchestrator.on_start().await.unwrap_err();
        match err {
            DiscoveryError::RegistrationFailed(inner) => assert!(matches!(
                *inner,
                DiscoveryError::RequiredDependencyUnavailable(ref name) if name == "mail"
            )),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_without_dependencies_is_unknown() {
        let (_ensemble, _client, orchestrator) = build(&config(8080));
        let err = orchestrator.resolve("mail").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownDependency(_)));
    }

    #[tokio::test]
    async fn test_set_configured_port_reregisters_with_new_port() {
        let (ensemble, client, orchestrator) = build(&config(8080));
        orchestrator.on_start().await.unwrap();

        orchestrator.set_configured_port(9090).await.unwrap();
        assert_eq!(orchestrator.configured_port(), 9090);
        assert_eq!(client.delete_calls(), 1);
        assert_eq!(client.create_calls(), 2);

        let stored = ServiceInstance::from_payload(NODE, &ensemble.data(NODE).unwrap()).unwrap();
        assert_eq!(stored.port, 9090);
        orchestrator.on_stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_respects_shutdown_deadline() {
        let mut cfg = config(8080);
        cfg.zookeeper.operation_timeout_ms = 60_000;
        cfg.zookeeper.shutdown_deadline_ms = 100;
        let (_ensemble, client, orchestrator) = build(&cfg);
        orchestrator.on_start().await.unwrap();

        client.set_stalled(true);
        let started = tokio::time::Instant::now();
        orchestrator.on_stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_hit_deadline() {
        let mut cfg = config(8080);
        cfg.zookeeper.operation_timeout_ms = 60_000;
        cfg.zookeeper.shutdown_deadline_ms = 100;
        let (ensemble, client, orchestrator) = build(&cfg);
        orchestrator.on_start().await.unwrap();

        client.set_stalled(true);
        orchestrator.on_stop().await;
        assert_eq!(orchestrator.state(), RegistrationState::Unregistered);

        client.set_stalled(false);
        orchestrator.on_start().await.unwrap();
        assert!(orchestrator.is_running());
        assert_eq!(orchestrator.state(), RegistrationState::Registered);
        assert!(ensemble.exists(NODE));

        orchestrator.set_configured_port(9090).await.unwrap();
        let stored = ServiceInstance::from_payload(NODE, &ensemble.data(NODE).unwrap()).unwrap();
        assert_eq!(stored.port, 9090);
        orchestrator.on_stop().await;
    }

    #[tokio::test]
    async fn test_set_configured_port_never_leaves_stale_port() {
        let (ensemble, client, orchestrator) = build(&config(8080));
        orchestrator.on_start().await.unwrap();
        client.inject_faults(Operation::Delete, [Fault::ConnectionLoss]);

        orchestrator.set_configured_port(9090).await.unwrap();
        assert_eq!(orchestrator.state(), RegistrationState::Registered);
        let stored = ServiceInstance::from_payload(NODE, &ensemble.data(NODE).unwrap()).unwrap();
        assert_eq!(stored.port, 9090);
        orchestrator.on_stop().await;
    }

    #[tokio::test]
    async fn test_initial_dependency_refresh_completes_before_start_returns() {
        let (ensemble, _client, orchestrator) = build(&with_dependency(config(8080), true));
        let provider = ensemble.connect();
        let mail = InstanceTemplate::new("mail", "10.0.0.2", 25)
            .with_instance_id("m-1")
            .build();
        provider
            .create_ephemeral("/services/mail/m-1", mail.to_payload().unwrap())
            .await
            .unwrap();

        orchestrator.on_start().await.unwrap();
        assert_eq!(orchestrator.resolve("mail").await.unwrap().len(), 1);
        orchestrator.on_stop().await;
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut cfg = config(8080);
        cfg.zookeeper.root = "services".to_string();
        let ensemble = InMemoryEnsemble::new();
        let result = LifecycleOrchestrator::new(&cfg, ensemble.connect());
        assert!(matches!(result, Err(DiscoveryError::ConfigurationInvalid(_))));
    }
}
