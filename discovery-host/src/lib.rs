//! 注册发现宿主进程
//!
//! 加载配置、构建生命周期编排器，并把进程的启动 / 停止事件转交给它。

pub mod bootstrap;

pub use bootstrap::ApplicationBootstrap;
