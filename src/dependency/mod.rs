//! 依赖服务发现
//!
//! - `DependencyDescriptor`：从配置加载的依赖声明
//! - `LoadBalancer`：按策略给出实例顺序（轮询 / 随机 / 粘滞）
//! - `DependencyResolver`：监听依赖路径，维护无锁读取的端点缓存

mod balancer;
mod descriptor;
mod resolver;

pub use balancer::{LoadBalancer, LoadBalancerType};
pub use descriptor::DependencyDescriptor;
pub use resolver::{DependencyResolver, EndpointSnapshot};
