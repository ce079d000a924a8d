//! 插件系统
//!
//! 插件是针对某个账号执行的一段独立工作（如「每日委托」「领取邮件」）。
//! 核心只依赖 Plugin trait：标识、排序提示、生命周期、执行与协作式控制。
//!
//! - catalog：静态注册表（来源单元 → 插件工厂）
//! - registry：发现、实例化、去重、启用列表过滤、卸载
//! - executor：在失败边界内执行单个插件
//! - record：运行记录与步骤轨迹

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{ExecutionContext, PluginFault};

pub mod catalog;
pub mod executor;
pub mod record;
pub mod registry;

pub use catalog::{LoadContext, PluginCatalog, PluginFactory, PLUGIN_SUFFIX};
pub use executor::PluginExecutor;
pub use record::{RunRecord, RunStatus, Trace, TraceStep};
pub use registry::{Admission, LoadReport, PluginRegistry};

/// 默认优先级（中位值）；数值越小越先执行
pub const DEFAULT_PRIORITY: i32 = 100;

/// 暂停时的默认轮询间隔
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(100);

/// 单次执行参数
pub type PluginArgs = Map<String, Value>;

#[derive(Debug, Default)]
struct RunFlags {
    running: bool,
    paused: bool,
}

/// 插件运行状态：由插件自己的锁保护，与调度器 / 缓存的锁无关
#[derive(Debug)]
pub struct RunControl {
    flags: Mutex<RunFlags>,
    changed: Condvar,
    poll: Duration,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new(DEFAULT_PAUSE_POLL)
    }
}

impl RunControl {
    pub fn new(poll: Duration) -> Self {
        Self {
            flags: Mutex::new(RunFlags::default()),
            changed: Condvar::new(),
            poll,
        }
    }

    /// 标记为运行中；返回的守卫在任何退出路径上清除运行标志
    pub fn begin(&self) -> RunningGuard<'_> {
        let mut flags = self.flags.lock();
        flags.running = true;
        flags.paused = false;
        RunningGuard { control: self }
    }

    /// 返回是否生效（未运行的插件上无效）
    pub fn pause(&self) -> bool {
        let mut flags = self.flags.lock();
        if !flags.running {
            return false;
        }
        flags.paused = true;
        true
    }

    pub fn resume(&self) -> bool {
        let mut flags = self.flags.lock();
        if !flags.running {
            return false;
        }
        flags.paused = false;
        self.changed.notify_all();
        true
    }

    pub fn stop(&self) -> bool {
        let mut flags = self.flags.lock();
        if !flags.running {
            return false;
        }
        flags.running = false;
        flags.paused = false;
        self.changed.notify_all();
        true
    }

    pub fn is_running(&self) -> bool {
        self.flags.lock().running
    }

    pub fn is_paused(&self) -> bool {
        self.flags.lock().paused
    }

    /// 暂停期间阻塞，直到 resume 或 stop（stop 优先于 pause）
    pub fn wait_if_paused(&self) {
        let mut flags = self.flags.lock();
        while flags.paused && flags.running {
            self.changed.wait_for(&mut flags, self.poll);
        }
    }

    /// 步骤边界：等待暂停解除，返回是否应继续执行
    pub fn checkpoint(&self) -> bool {
        self.wait_if_paused();
        self.is_running()
    }

    fn finish(&self) {
        let mut flags = self.flags.lock();
        flags.running = false;
        flags.paused = false;
        self.changed.notify_all();
    }
}

/// 运行标志守卫
pub struct RunningGuard<'a> {
    control: &'a RunControl,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.control.finish();
    }
}

/// 插件 trait
///
/// 名称在注册表内唯一。`execute` 应在逻辑步骤之间调用 `checkpoint()`，
/// 以响应暂停与停止；调度器从不强行打断正在执行的步骤。
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// 分组标签（如 "daily"、"battle"）
    fn category(&self) -> &str {
        "general"
    }

    /// 实例化时注入的执行上下文
    fn context(&self) -> &ExecutionContext;

    fn control(&self) -> &RunControl;

    /// 轻量就绪检查，不得修改状态；默认检查执行上下文是否可达
    fn can_execute(&self, _args: &PluginArgs) -> bool {
        self.context().is_available()
    }

    /// 执行工作单元，返回步骤轨迹
    fn execute(&self, args: &PluginArgs) -> Result<Trace, PluginFault>;

    /// 注册时调用一次；失败则不注册
    fn setup(&self) -> Result<(), PluginFault> {
        tracing::debug!(plugin = %self.name(), "plugin setup");
        Ok(())
    }

    /// 卸载时调用一次；失败只记录日志
    fn teardown(&self) -> Result<(), PluginFault> {
        tracing::debug!(plugin = %self.name(), "plugin teardown");
        Ok(())
    }

    fn pause(&self) {
        if self.control().pause() {
            tracing::info!(plugin = %self.name(), "plugin paused");
        }
    }

    fn resume(&self) {
        if self.control().resume() {
            tracing::info!(plugin = %self.name(), "plugin resumed");
        }
    }

    fn stop(&self) {
        if self.control().stop() {
            tracing::info!(plugin = %self.name(), "plugin stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.control().is_running()
    }

    fn is_paused(&self) -> bool {
        self.control().is_paused()
    }

    fn wait_if_paused(&self) {
        self.control().wait_if_paused()
    }

    fn checkpoint(&self) -> bool {
        self.control().checkpoint()
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            version: self.version().to_string(),
            priority: self.priority(),
            category: self.category().to_string(),
            running: self.is_running(),
            paused: self.is_paused(),
        }
    }
}

/// 插件描述快照（供列表展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub version: String,
    pub priority: i32,
    pub category: String,
    pub running: bool,
    pub paused: bool,
}
