//! TaskHive - 多账号插件编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 执行上下文、错误与恢复策略、资源缓存、任务调度、多账号监管、优雅关闭
//! - **observability**: tracing 日志初始化
//! - **plugins**: 插件契约、静态目录、注册表与执行器

pub mod config;
pub mod core;
pub mod observability;
pub mod plugins;

pub use crate::core::{ErrorResolver, ExecutionContext, HiveError, Strategy, TaskScheduler};
pub use crate::plugins::{Plugin, PluginCatalog, PluginRegistry};
