//! 任务调度：单账号的插件编排
//!
//! 状态机：Idle → Running ⇄ Waiting → Stopped | Completed。
//! 每次运行由一个专用后台线程驱动：按优先级升序（同优先级保持添加顺序）依次执行插件，
//! 失败交给 ErrorResolver，再按策略处理：
//! - Wait：停止推进，等待 resume 后重新执行同一插件
//! - Skip：记录并进入下一个插件
//! - Retry：再执行一次；若仍失败，记录并进入下一个（不会二次重试）
//! - Stop：立即终止整次运行
//!
//! stop() 只发出请求，不等待线程退出；需要屏障的调用方轮询 state() 或 join()。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::core::{ErrorResolver, ExecutionContext, HiveError, Strategy};
use crate::plugins::executor::panic_message;
use crate::plugins::{Plugin, PluginArgs, PluginExecutor, PluginRegistry, RunRecord};

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    /// Wait 策略生效，等待 resume
    Waiting,
    Stopped,
    Completed,
}

impl SchedulerState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// 所有插件都已处理
    Completed,
    /// 被 stop() 或 Stop 策略中止
    Stopped,
}

/// 一次运行的汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub account: String,
    pub records: Vec<RunRecord>,
    pub outcome: RunOutcome,
    pub started_at: i64,
    pub finished_at: i64,
}

impl RunReport {
    pub fn record(&self, plugin: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.plugin == plugin)
    }

    /// 按执行顺序列出被执行过的插件
    pub fn executed(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.plugin.as_str()).collect()
    }
}

struct Control {
    state: SchedulerState,
    resume_requested: bool,
}

/// 单个插件处理完毕后的走向
enum Step {
    Next(RunRecord),
    Halt(RunRecord),
}

struct Shared {
    ctx: ExecutionContext,
    resolver: Arc<ErrorResolver>,
    args: Mutex<PluginArgs>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    control: Mutex<Control>,
    wake: Condvar,
    current: Mutex<Option<Arc<dyn Plugin>>>,
    state_tx: watch::Sender<SchedulerState>,
    last_report: Mutex<Option<RunReport>>,
}

impl Shared {
    fn set_state(&self, control: &mut Control, state: SchedulerState) {
        control.state = state;
        self.state_tx.send_replace(state);
    }

    fn is_running(&self) -> bool {
        self.control.lock().state.is_active()
    }

    /// 快照并按优先级稳定排序
    fn ordered_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        let mut plugins = self.plugins.lock().clone();
        plugins.sort_by_key(|p| p.priority());
        plugins
    }

    fn run(&self) -> RunReport {
        let _span = self.ctx.span().enter();
        let _unwind = UnwindGuard(self);
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let started_at = chrono::Utc::now().timestamp_millis();
        let plugins = self.ordered_plugins();
        let args = self.args.lock().clone();
        tracing::info!(run_id = %run_id, plugins = plugins.len(), "run started");

        let mut records = Vec::with_capacity(plugins.len());
        let mut outcome = RunOutcome::Completed;
        for plugin in &plugins {
            if !self.is_running() {
                tracing::info!(run_id = %run_id, "run stopped before {}", plugin.name());
                outcome = RunOutcome::Stopped;
                break;
            }

            *self.current.lock() = Some(Arc::clone(plugin));
            let step = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(plugin, &args)))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(plugin = %plugin.name(), error = %message, "dispatch panicked, moving on");
                    Step::Next(RunRecord::failure(
                        plugin.name(),
                        self.ctx.account(),
                        format!("dispatch panicked: {message}"),
                    ))
                });
            *self.current.lock() = None;

            match step {
                Step::Next(record) => records.push(record),
                Step::Halt(record) => {
                    records.push(record);
                    outcome = RunOutcome::Stopped;
                    break;
                }
            }
        }

        {
            let mut control = self.control.lock();
            if control.state.is_active() {
                let state = match outcome {
                    RunOutcome::Completed => SchedulerState::Completed,
                    RunOutcome::Stopped => SchedulerState::Stopped,
                };
                self.set_state(&mut control, state);
            } else {
                outcome = RunOutcome::Stopped;
            }
        }

        let report = RunReport {
            run_id,
            account: self.ctx.account().to_string(),
            records,
            outcome,
            started_at,
            finished_at: chrono::Utc::now().timestamp_millis(),
        };
        tracing::info!(
            run_id = %report.run_id,
            outcome = ?report.outcome,
            records = report.records.len(),
            "run finished"
        );
        *self.last_report.lock() = Some(report.clone());
        report
    }

    fn dispatch(&self, plugin: &Arc<dyn Plugin>, args: &PluginArgs) -> Step {
        let name = plugin.name();
        let mut attempts = 0u32;
        let mut retried = false;

        loop {
            attempts += 1;
            let failure = match PluginExecutor::invoke_gated(plugin.as_ref(), args, || self.is_running()) {
                Ok(mut record) => {
                    record.attempts = attempts;
                    if retried {
                        record.strategy = Some(Strategy::Retry);
                    }
                    return Step::Next(record);
                }
                Err(failure) => failure,
            };

            let mut record = RunRecord::failure(name, self.ctx.account(), failure.to_string());
            record.attempts = attempts;

            if !self.is_running() {
                tracing::info!(plugin = %name, "run stopped while plugin was executing");
                return Step::Halt(record);
            }

            if retried {
                tracing::warn!(plugin = %name, attempts, "retry failed, moving on");
                record.strategy = Some(Strategy::Retry);
                return Step::Next(record);
            }

            let strategy = match self.resolver.resolve(&failure, &self.ctx, Some(plugin.category())) {
                Ok(strategy) => strategy,
                Err(e) => {
                    tracing::error!(plugin = %name, error = %e, "failure unresolved, moving on");
                    return Step::Next(record);
                }
            };
            record.strategy = Some(strategy);

            match strategy {
                Strategy::Skip => {
                    tracing::info!(plugin = %name, "skipping plugin");
                    return Step::Next(record);
                }
                Strategy::Retry => {
                    tracing::info!(plugin = %name, "retrying plugin once");
                    retried = true;
                }
                Strategy::Stop => {
                    tracing::warn!(plugin = %name, "stopping run");
                    let mut control = self.control.lock();
                    if control.state.is_active() {
                        self.set_state(&mut control, SchedulerState::Stopped);
                    }
                    return Step::Halt(record);
                }
                Strategy::Wait => {
                    tracing::warn!(plugin = %name, error = %failure, "waiting for resume");
                    if !self.wait_for_resume() {
                        return Step::Halt(record);
                    }
                    tracing::info!(plugin = %name, "resumed, attempting plugin again");
                }
            }
        }
    }

    /// 阻塞直到 resume（返回 true）或 stop（返回 false）
    fn wait_for_resume(&self) -> bool {
        let mut control = self.control.lock();
        if control.state != SchedulerState::Running {
            return false;
        }
        control.resume_requested = false;
        self.set_state(&mut control, SchedulerState::Waiting);

        while !control.resume_requested && control.state == SchedulerState::Waiting {
            self.wake.wait(&mut control);
        }

        if control.state == SchedulerState::Waiting {
            self.set_state(&mut control, SchedulerState::Running);
            true
        } else {
            false
        }
    }
}

/// 工作线程异常退出时仍写回终态并清空 current
struct UnwindGuard<'a>(&'a Shared);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        *self.0.current.lock() = None;
        let mut control = self.0.control.lock();
        if control.state.is_active() {
            self.0.set_state(&mut control, SchedulerState::Stopped);
        }
    }
}

/// 单账号调度器
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<RunReport>>>,
}

impl TaskScheduler {
    pub fn new(ctx: ExecutionContext, resolver: Arc<ErrorResolver>) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            shared: Arc::new(Shared {
                ctx,
                resolver,
                args: Mutex::new(PluginArgs::new()),
                plugins: Mutex::new(Vec::new()),
                control: Mutex::new(Control {
                    state: SchedulerState::Idle,
                    resume_requested: false,
                }),
                wake: Condvar::new(),
                current: Mutex::new(None),
                state_tx,
                last_report: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// 以注册表的当前列表（已按优先级排序）填充调度器
    pub fn from_registry(registry: &PluginRegistry, resolver: Arc<ErrorResolver>) -> Self {
        let scheduler = Self::new(registry.context().clone(), resolver);
        for plugin in registry.list() {
            scheduler.add(plugin);
        }
        scheduler
    }

    pub fn account(&self) -> &str {
        self.shared.ctx.account()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.shared.ctx
    }

    /// 每次运行传给所有插件的参数
    pub fn set_args(&self, args: PluginArgs) {
        *self.shared.args.lock() = args;
    }

    /// 添加插件；对正在进行的运行不生效
    pub fn add(&self, plugin: Arc<dyn Plugin>) {
        self.shared.plugins.lock().push(plugin);
    }

    /// 按名称移除插件
    pub fn remove(&self, name: &str) -> bool {
        let mut plugins = self.shared.plugins.lock();
        let before = plugins.len();
        plugins.retain(|p| p.name() != name);
        plugins.len() != before
    }

    /// 按执行顺序列出插件名
    pub fn plugins(&self) -> Vec<String> {
        self.shared
            .ordered_plugins()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.control.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.shared.state_tx.subscribe()
    }

    /// 正在执行的插件名
    pub fn current(&self) -> Option<String> {
        self.shared
            .current
            .lock()
            .as_ref()
            .map(|p| p.name().to_string())
    }

    /// 启动后台运行；已在运行（或上一次的线程尚未退出）时返回 Ok(false)
    pub fn start(&self) -> Result<bool, HiveError> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return Ok(false);
            }
        }

        {
            let mut control = self.shared.control.lock();
            if control.state.is_active() {
                return Ok(false);
            }
            control.resume_requested = false;
            self.shared.set_state(&mut control, SchedulerState::Running);
        }

        if let Some(finished) = worker.take() {
            if let Err(payload) = finished.join() {
                tracing::warn!(
                    account = %self.account(),
                    error = %panic_message(payload.as_ref()),
                    "previous scheduler worker panicked"
                );
            }
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("scheduler-{}", self.account()))
            .spawn(move || shared.run());

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(true)
            }
            Err(e) => {
                let mut control = self.shared.control.lock();
                self.shared.set_state(&mut control, SchedulerState::Idle);
                Err(HiveError::Worker(e.to_string()))
            }
        }
    }

    /// 请求停止：清除运行标志，并停止正在执行的插件；不等待线程退出
    pub fn stop(&self) {
        {
            let mut control = self.shared.control.lock();
            if control.state.is_active() {
                self.shared.set_state(&mut control, SchedulerState::Stopped);
                self.shared.wake.notify_all();
                tracing::info!(account = %self.account(), "scheduler stop requested");
            }
        }
        let current = self.shared.current.lock().clone();
        if let Some(plugin) = current {
            plugin.stop();
        }
    }

    /// 暂停正在执行的插件（插件在步骤边界响应）
    pub fn pause(&self) {
        let current = self.shared.current.lock().clone();
        if let Some(plugin) = current {
            plugin.pause();
        }
    }

    /// 恢复正在执行的插件，并解除 Wait
    pub fn resume(&self) {
        {
            let mut control = self.shared.control.lock();
            if control.state == SchedulerState::Waiting {
                control.resume_requested = true;
                self.shared.wake.notify_all();
            }
        }
        let current = self.shared.current.lock().clone();
        if let Some(plugin) = current {
            plugin.resume();
        }
    }

    /// 阻塞等待当前运行结束并返回报告
    pub fn join(&self) -> Result<RunReport, HiveError> {
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| HiveError::Worker("scheduler worker panicked".into())),
            None => self
                .last_report()
                .ok_or_else(|| HiveError::Worker("scheduler never started".into())),
        }
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.shared.last_report.lock().clone()
    }

    /// 异步等待直到不再处于 Running / Waiting
    pub async fn finished(&self) -> SchedulerState {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if !state.is_active() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}
