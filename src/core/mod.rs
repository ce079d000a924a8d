//! 核心层：执行上下文、错误与恢复策略、资源缓存、任务调度、多账号监管、优雅关闭

pub mod cache;
pub mod context;
pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod supervisor;
pub mod task_scheduler;

pub use cache::{Resource, ResourceCache, ResourceKey};
pub use context::{
    ContextBuilder, DeviceControl, DeviceSession, ElementMatch, ExecutionContext, Screenshot,
    TextItem, Vision,
};
pub use error::{FailureKind, HiveError, LoadFailure, PluginFault, Strategy};
pub use recovery::{
    ErrorResolver, FailureHandler, FailureReport, InteractiveResolver, ScriptedResolver,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use supervisor::SchedulerPool;
pub use task_scheduler::{RunOutcome, RunReport, SchedulerState, TaskScheduler};
