//! 注册与依赖发现端到端测试：同一个进程内协调服务上的提供方与消费方

use std::sync::Arc;
use std::time::Duration;

use flare_zk_discovery::coordination::{InMemoryCoordinator, InMemoryEnsemble};
use flare_zk_discovery::{
    DiscoveryAppConfig, DiscoveryError, Lifecycle, LifecycleOrchestrator, RegistrationState,
    ServiceInstance, gather_metrics, initialize,
};

fn provider_config(port: u16) -> DiscoveryAppConfig {
    DiscoveryAppConfig::from_toml_str(&format!(
        r#"
        [service]
        name = "mail"

        [zookeeper]
        port = {port}
        instance_host = "10.0.0.7"
        instance_id = "mail-1"
        retry_backoff_ms = 1

        [zookeeper.metadata]
        zone = "az-1"
        "#
    ))
    .unwrap()
}

fn consumer_config() -> DiscoveryAppConfig {
    DiscoveryAppConfig::from_toml_str(
        r#"
        [service]
        name = "billing"

        [zookeeper]
        port = 8080
        instance_id = "billing-1"

        [zookeeper.dependencies.mail]
        path = "/mail"
        load_balancer = "round-robin"
        content_type_template = "application/vnd.mail.$version+json"
        version = "v1"

        [zookeeper.dependencies.mail.headers]
        X-Tenant = "acme"
        "#,
    )
    .unwrap()
}

async fn start(
    ensemble: &InMemoryEnsemble,
    config: &DiscoveryAppConfig,
) -> (Arc<InMemoryCoordinator>, Arc<LifecycleOrchestrator>) {
    let client = ensemble.connect();
    let context = initialize(config, client.clone()).unwrap();
    context.orchestrator.on_start().await.unwrap();
    (client, context.orchestrator)
}

async fn resolved(consumer: &LifecycleOrchestrator) -> Vec<ServiceInstance> {
    consumer.resolve("mail").await.unwrap()
}

/// 轮询直到同步条件成立
async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

/// 轮询直到消费方解析到的 mail 实例满足条件
async fn wait_for_endpoints<F: Fn(&[ServiceInstance]) -> bool>(
    consumer: &LifecycleOrchestrator,
    condition: F,
) {
    for _ in 0..400 {
        if condition(&resolved(consumer).await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("endpoints did not converge within timeout");
}

#[tokio::test]
async fn consumer_discovers_provider_lifecycle() {
    let ensemble = InMemoryEnsemble::new();
    let (_consumer_client, consumer) = start(&ensemble, &consumer_config()).await;
    assert!(resolved(&consumer).await.is_empty());

    let (_provider_client, provider) = start(&ensemble, &provider_config(2525)).await;
    assert_eq!(provider.state(), RegistrationState::Registered);

    wait_for_endpoints(&consumer, |list| list.len() == 1).await;
    let mail = resolved(&consumer).await.remove(0);
    assert_eq!(mail.service_id, "mail");
    assert_eq!(mail.instance_id, "mail-1");
    assert_eq!(mail.uri(), "http://10.0.0.7:2525");
    assert_eq!(mail.metadata.get("zone").map(String::as_str), Some("az-1"));

    let descriptor = consumer.resolver().unwrap().descriptor("mail").unwrap();
    assert_eq!(descriptor.coordination_path, "/services/mail");
    assert_eq!(
        descriptor.content_type().as_deref(),
        Some("application/vnd.mail.v1+json")
    );
    assert_eq!(descriptor.headers.get("X-Tenant").map(String::as_str), Some("acme"));

    provider.set_configured_port(2626).await.unwrap();
    wait_for_endpoints(&consumer, |list| list.len() == 1 && list[0].port == 2626).await;

    provider.on_stop().await;
    wait_for_endpoints(&consumer, |list| list.is_empty()).await;

    let err = consumer.resolve("billing").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::UnknownDependency(_)));

    consumer.on_stop().await;
    assert!(!ensemble.exists("/services/billing/billing-1"));
}

#[tokio::test]
async fn provider_session_expiry_is_repaired() {
    let ensemble = InMemoryEnsemble::new();
    let (_consumer_client, consumer) = start(&ensemble, &consumer_config()).await;
    let (provider_client, provider) = start(&ensemble, &provider_config(2525)).await;
    wait_for_endpoints(&consumer, |list| list.len() == 1).await;

    provider_client.expire_session();

    wait_until(|| {
        provider_client.create_calls() == 2 && provider.state() == RegistrationState::Registered
    })
    .await;
    assert!(ensemble.exists("/services/mail/mail-1"));
    wait_for_endpoints(&consumer, |list| list.len() == 1).await;

    provider.on_stop().await;
    consumer.on_stop().await;
}

#[tokio::test]
async fn consumer_serves_stale_endpoints_while_suspended() {
    let ensemble = InMemoryEnsemble::new();
    let (consumer_client, consumer) = start(&ensemble, &consumer_config()).await;
    let (_provider_client, provider) = start(&ensemble, &provider_config(2525)).await;
    wait_for_endpoints(&consumer, |list| list.len() == 1).await;

    let resolver = consumer.resolver().unwrap().clone();
    consumer_client.suspend();
    wait_until(|| resolver.is_stale("mail").unwrap()).await;

    // 挂起期间提供方下线，消费方仍返回最后一次成功的列表
    provider.on_stop().await;
    assert_eq!(resolved(&consumer).await.len(), 1);

    consumer_client.reconnect();
    wait_until(|| !resolver.is_stale("mail").unwrap()).await;
    assert!(resolved(&consumer).await.is_empty());

    assert!(gather_metrics().contains("zk_dependency_stale"));
    consumer.on_stop().await;
}
