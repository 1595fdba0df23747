//! 负载均衡策略
//!
//! 策略只决定实例的返回顺序，调用方取第一个即可，失败时依次尝试后续实例。

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::instance::ServiceInstance;

/// 负载均衡类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancerType {
    /// 轮询（默认）
    #[default]
    #[serde(alias = "round_robin", alias = "ROUND_ROBIN", alias = "roundrobin")]
    RoundRobin,
    /// 随机
    #[serde(alias = "RANDOM")]
    Random,
    /// 粘滞：持续返回同一实例，直到其下线
    #[serde(alias = "STICKY")]
    Sticky,
}

/// 单个依赖的负载均衡器
#[derive(Debug)]
pub struct LoadBalancer {
    kind: LoadBalancerType,
    /// 轮询游标
    cursor: AtomicUsize,
    /// 粘滞实例 ID
    sticky: Mutex<Option<String>>,
}

impl LoadBalancer {
    pub fn new(kind: LoadBalancerType) -> Self {
        Self {
            kind,
            cursor: AtomicUsize::new(0),
            sticky: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> LoadBalancerType {
        self.kind
    }

    /// 按策略给出实例顺序
    pub fn order(&self, instances: &[ServiceInstance]) -> Vec<ServiceInstance> {
        if instances.is_empty() {
            return Vec::new();
        }

        let mut ordered = instances.to_vec();
        match self.kind {
            LoadBalancerType::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed);
                ordered.rotate_left(index % instances.len());
            }
            LoadBalancerType::Random => {
                ordered.shuffle(&mut rand::thread_rng());
            }
            LoadBalancerType::Sticky => {
                let mut sticky = self.sticky.lock();
                let position = sticky
                    .as_ref()
                    .and_then(|id| ordered.iter().position(|i| &i.instance_id == id));
                match position {
                    Some(position) => ordered.rotate_left(position),
                    None => {
                        ordered.shuffle(&mut rand::thread_rng());
                        *sticky = Some(ordered[0].instance_id.clone());
                    }
                }
            }
        }
        ordered
    }
}
