//! 依赖清单激活判定
//!
//! 只有声明了至少一个依赖时才需要启动依赖解析器。判定只读取配置快照，不做任何 I/O。

use crate::config::ConfigSnapshot;

/// 依赖清单在配置命名空间中的键
pub const DEPENDENCIES_KEY: &str = "dependencies";

/// 判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationOutcome {
    pub matched: bool,
    pub message: String,
}

/// 激活判定器
#[derive(Debug, Clone)]
pub struct ActivationPredicate {
    /// 依赖清单根键，例如 `dependencies` 或 `zookeeper.dependencies`
    root: String,
}

impl Default for ActivationPredicate {
    fn default() -> Self {
        Self::new(DEPENDENCIES_KEY)
    }
}

impl ActivationPredicate {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn evaluate(&self, namespace: &ConfigSnapshot) -> ActivationOutcome {
        let entries = namespace.sub_properties(&self.root);
        if entries.is_empty() {
            ActivationOutcome {
                matched: false,
                message: "No dependencies have been passed for the service".to_string(),
            }
        } else {
            ActivationOutcome {
                matched: true,
                message: format!(
                    "Dependencies have been passed for the service ({} properties under `{}`)",
                    entries.len(),
                    self.root
                ),
            }
        }
    }
}

/// 命名空间下 `dependencies` 至少包含一个条目时返回 true
pub fn should_activate(namespace: &ConfigSnapshot) -> bool {
    ActivationPredicate::default().evaluate(namespace).matched
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::{DependencyConfig, DiscoveryAppConfig};

    #[test]
    fn test_empty_namespace_does_not_activate() {
        let outcome = ActivationPredicate::default().evaluate(&ConfigSnapshot::default());
        assert!(!outcome.matched);
        assert_eq!(
            outcome.message,
            "No dependencies have been passed for the service"
        );
        assert!(!should_activate(&ConfigSnapshot::default()));
    }

    #[test]
    fn test_single_dependency_activates() {
        let snapshot = ConfigSnapshot::from_pairs([("dependencies.foo.path", "/foo")]);
        assert!(should_activate(&snapshot));
    }

    #[test]
    fn test_unrelated_keys_do_not_activate() {
        let snapshot = ConfigSnapshot::from_pairs([
            ("enabled", "true"),
            ("dependencies_backup.foo", "x"),
        ]);
        assert!(!should_activate(&snapshot));
    }

    #[test]
    fn test_custom_root_over_full_config() {
        let mut config = DiscoveryAppConfig::default();
        let predicate = ActivationPredicate::new("zookeeper.dependencies");
        assert!(!predicate.evaluate(&config.snapshot()).matched);

        config.zookeeper.dependencies = BTreeMap::from([(
            "mail".to_string(),
            DependencyConfig {
                path: "/mail".to_string(),
                load_balancer: Default::default(),
                content_type_template: None,
                version: None,
                headers: BTreeMap::new(),
                required: false,
            },
        )]);
        assert!(predicate.evaluate(&config.snapshot()).matched);
        assert!(should_activate(&config.snapshot().namespace("zookeeper")));
    }
}
