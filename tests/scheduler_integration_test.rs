//! 调度集成测试：目录 → 注册表 → 调度器 → 资源缓存

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use taskhive::config::{load_config, PluginSettings};
use taskhive::core::{
    DeviceControl, DeviceSession, ElementMatch, ErrorResolver, ExecutionContext, HiveError,
    PluginFault, ResourceCache, RunOutcome, SchedulerPool, SchedulerState, Screenshot,
    ScriptedResolver, Strategy, TaskScheduler, TextItem, Vision,
};
use taskhive::plugins::{
    Plugin, PluginArgs, PluginCatalog, PluginRegistry, RunControl, RunStatus, Trace,
};

struct FakeDevice {
    connected: AtomicBool,
    clicks: AtomicUsize,
}

impl FakeDevice {
    fn online() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            clicks: AtomicUsize::new(0),
        })
    }
}

impl DeviceControl for FakeDevice {
    fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    fn click(&self, _x: i32, _y: i32) -> anyhow::Result<()> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn screenshot(&self) -> anyhow::Result<Screenshot> {
        Ok(Screenshot {
            width: 1280,
            height: 720,
            pixels: Vec::new(),
        })
    }
}

/// 只认识 "claim" 模板
struct FakeVision;

impl Vision for FakeVision {
    fn find_element(&self, _image: &Screenshot, template: &str) -> Option<ElementMatch> {
        (template == "claim").then_some(ElementMatch {
            x: 640,
            y: 360,
            confidence: 0.93,
        })
    }
    fn recognize_text(&self, _image: &Screenshot) -> Vec<TextItem> {
        Vec::new()
    }
}

/// 截图 → 找模板 → 点击；找不到模板时失败
struct TapPlugin {
    name: &'static str,
    priority: i32,
    template: &'static str,
    ctx: ExecutionContext,
    control: RunControl,
}

impl TapPlugin {
    fn new(ctx: &ExecutionContext, name: &'static str, priority: i32, template: &'static str) -> Self {
        Self {
            name,
            priority,
            template,
            ctx: ctx.clone(),
            control: RunControl::default(),
        }
    }
}

impl Plugin for TapPlugin {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "tap a template"
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn category(&self) -> &str {
        "daily"
    }
    fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
    fn control(&self) -> &RunControl {
        &self.control
    }
    fn execute(&self, _args: &PluginArgs) -> Result<Trace, PluginFault> {
        let device = self
            .ctx
            .device()
            .ok_or_else(|| PluginFault::device("no device"))?;
        let vision = self
            .ctx
            .vision()
            .ok_or_else(|| PluginFault::device("no vision"))?;

        let mut trace = Trace::new();
        let image = device.screenshot()?;
        trace.step("screenshot", serde_json::json!({ "width": image.width }));
        let found = vision
            .find_element(&image, self.template)
            .ok_or_else(|| PluginFault::element_not_found(self.template))?;
        device.click(found.x, found.y)?;
        trace.step("click", serde_json::json!({ "x": found.x, "y": found.y }));
        Ok(trace)
    }
}

fn context(account: &str, device: Arc<FakeDevice>) -> ExecutionContext {
    ExecutionContext::builder(account, "127.0.0.1:16384")
        .device(device)
        .vision(Arc::new(FakeVision))
        .build()
}

fn daily_catalog() -> PluginCatalog {
    PluginCatalog::new()
        .with_plugin("plugins/daily/entrust_plugin", |ctx| {
            TapPlugin::new(ctx, "daily_entrust", 10, "claim")
        })
        .with_plugin("plugins/daily/mail_plugin", |ctx| {
            TapPlugin::new(ctx, "daily_mail", 20, "claim")
        })
        .with_plugin("plugins/daily/shop_plugin", |ctx| {
            TapPlugin::new(ctx, "daily_shop", 5, "claim")
        })
}

#[test]
fn test_enable_list_end_to_end() {
    let device = FakeDevice::online();
    let registry = PluginRegistry::new(context("main", device.clone()), daily_catalog())
        .with_enabled(["daily_entrust", "daily_mail"]);
    let loaded = registry.load(&["plugins/daily"]).unwrap();
    assert_eq!(loaded.units.len(), 3);
    assert_eq!(loaded.skipped, vec!["daily_shop".to_string()]);
    assert!(registry.get("daily_shop").is_none());

    let scheduler = TaskScheduler::from_registry(&registry, Arc::new(ErrorResolver::new()));
    scheduler.start().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(report.executed(), vec!["daily_entrust", "daily_mail"]);
    assert!(report.records.iter().all(|r| r.status == RunStatus::Success));
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(device.clicks.load(Ordering::SeqCst), 2);
    assert_eq!(report.record("daily_entrust").unwrap().trace.as_ref().unwrap().len(), 2);
}

#[test]
fn test_element_not_found_resolved_interactively() {
    let device = FakeDevice::online();
    let ctx = context("main", device.clone());
    let scheduler = {
        let scripted = Arc::new(ScriptedResolver::new([Strategy::Skip]));
        let resolver = ErrorResolver::new().with_interactive(scripted);
        TaskScheduler::new(ctx.clone(), Arc::new(resolver))
    };
    scheduler.add(Arc::new(TapPlugin::new(&ctx, "arena", 1, "challenge")));
    scheduler.add(Arc::new(TapPlugin::new(&ctx, "daily_mail", 2, "claim")));
    scheduler.start().unwrap();
    let report = scheduler.join().unwrap();

    let arena = report.record("arena").unwrap();
    assert_eq!(arena.status, RunStatus::Error);
    assert_eq!(arena.strategy, Some(Strategy::Skip));
    assert!(arena.error.as_deref().unwrap().contains("challenge"));
    assert!(report.record("daily_mail").unwrap().is_success());
}

#[test]
fn test_disconnected_device_is_not_ready() {
    let device = FakeDevice::online();
    device.disconnect();
    let ctx = context("main", device);
    let resolver = ErrorResolver::new().with_default(Some(Strategy::Stop));
    let scheduler = TaskScheduler::new(ctx.clone(), Arc::new(resolver));
    scheduler.add(Arc::new(TapPlugin::new(&ctx, "daily_entrust", 1, "claim")));
    scheduler.add(Arc::new(TapPlugin::new(&ctx, "daily_mail", 2, "claim")));
    scheduler.start().unwrap();
    let report = scheduler.join().unwrap();

    assert_eq!(report.executed(), vec!["daily_entrust"]);
    assert!(report.records[0].error.as_deref().unwrap().contains("not ready"));
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

/// 每次执行都从共享缓存取会话，并记录拿到的实例
struct SessionUser {
    name: &'static str,
    priority: i32,
    cache: Arc<ResourceCache<DeviceSession>>,
    seen: Arc<Mutex<Vec<(String, usize)>>>,
    ctx: ExecutionContext,
    control: RunControl,
}

impl Plugin for SessionUser {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "acquire a cached device session"
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
    fn control(&self) -> &RunControl {
        &self.control
    }
    fn execute(&self, _args: &PluginArgs) -> Result<Trace, PluginFault> {
        let session = self
            .cache
            .acquire(self.ctx.endpoint(), self.ctx.account())
            .map_err(|e| PluginFault::device(e.to_string()))?;
        let thread = thread::current().name().unwrap_or("").to_string();
        self.seen
            .lock()
            .unwrap()
            .push((thread, Arc::as_ptr(&session) as usize));
        Ok(Trace::new())
    }
}

#[test]
fn test_sessions_are_scoped_to_scheduler_threads() {
    let created = Arc::new(AtomicUsize::new(0));
    let cache = {
        let created = Arc::clone(&created);
        Arc::new(ResourceCache::new(move |_key| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(DeviceSession::new(FakeDevice::online(), Arc::new(FakeVision)))
        }))
    };
    let seen = Arc::new(Mutex::new(Vec::new()));

    // 两个调度器使用同一账号与端点，但各自运行在独立线程
    let schedulers: Vec<TaskScheduler> = (0..2)
        .map(|_| {
            let ctx = context("main", FakeDevice::online());
            let scheduler = TaskScheduler::new(ctx.clone(), Arc::new(ErrorResolver::new()));
            for (name, priority) in [("first", 1), ("second", 2)] {
                scheduler.add(Arc::new(SessionUser {
                    name,
                    priority,
                    cache: Arc::clone(&cache),
                    seen: Arc::clone(&seen),
                    ctx: ctx.clone(),
                    control: RunControl::default(),
                }));
            }
            scheduler
        })
        .collect();

    for scheduler in &schedulers {
        scheduler.start().unwrap();
    }
    for scheduler in &schedulers {
        assert_eq!(scheduler.join().unwrap().outcome, RunOutcome::Completed);
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|(thread, _)| thread == "scheduler-main"));
    assert_eq!(created.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);

    let mut instances: Vec<usize> = seen.iter().map(|(_, ptr)| *ptr).collect();
    instances.sort_unstable();
    instances.dedup();
    assert_eq!(instances.len(), 2);

    assert_eq!(cache.release_all(), 2);
    assert!(cache.is_empty());
}

/// 逐步推进的插件：每步之间是检查点
struct Stepper {
    steps: usize,
    done: Arc<AtomicUsize>,
    ctx: ExecutionContext,
    control: RunControl,
}

impl Plugin for Stepper {
    fn name(&self) -> &str {
        "stepper"
    }
    fn description(&self) -> &str {
        "advance step by step"
    }
    fn context(&self) -> &ExecutionContext {
        &self.ctx
    }
    fn control(&self) -> &RunControl {
        &self.control
    }
    fn execute(&self, _args: &PluginArgs) -> Result<Trace, PluginFault> {
        let mut trace = Trace::new();
        for i in 0..self.steps {
            if !self.checkpoint() {
                return Err(PluginFault::stopped());
            }
            thread::sleep(Duration::from_millis(5));
            self.done.fetch_add(1, Ordering::SeqCst);
            trace.step(format!("step_{i}"), serde_json::Value::Null);
        }
        Ok(trace)
    }
}

fn wait_for(mut f: impl FnMut() -> bool) {
    for _ in 0..400 {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition never met");
}

#[test]
fn test_pause_resume_through_scheduler() {
    let ctx = context("main", FakeDevice::online());
    let done = Arc::new(AtomicUsize::new(0));
    let stepper = Arc::new(Stepper {
        steps: 40,
        done: Arc::clone(&done),
        ctx: ctx.clone(),
        control: RunControl::new(Duration::from_millis(5)),
    });
    let scheduler = TaskScheduler::new(ctx, Arc::new(ErrorResolver::new()));
    scheduler.add(stepper.clone());
    scheduler.start().unwrap();

    wait_for(|| done.load(Ordering::SeqCst) >= 2);
    scheduler.pause();
    assert!(stepper.is_paused());
    thread::sleep(Duration::from_millis(30));
    let frozen = done.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(done.load(Ordering::SeqCst), frozen);
    assert_eq!(scheduler.state(), SchedulerState::Running);

    scheduler.resume();
    let report = scheduler.join().unwrap();
    assert!(report.record("stepper").unwrap().is_success());
    assert_eq!(done.load(Ordering::SeqCst), 40);
    assert!(!stepper.is_running());
}

#[test]
fn test_stop_mid_plugin_halts_run() {
    let ctx = context("main", FakeDevice::online());
    let done = Arc::new(AtomicUsize::new(0));
    let scheduler = TaskScheduler::new(ctx.clone(), Arc::new(ErrorResolver::new()));
    scheduler.add(Arc::new(Stepper {
        steps: 1000,
        done: Arc::clone(&done),
        ctx: ctx.clone(),
        control: RunControl::default(),
    }));
    scheduler.add(Arc::new(TapPlugin::new(&ctx, "daily_mail", 500, "claim")));
    scheduler.start().unwrap();

    wait_for(|| done.load(Ordering::SeqCst) >= 1);
    scheduler.stop();
    let report = scheduler.join().unwrap();

    assert_eq!(report.executed(), vec!["stepper"]);
    assert_eq!(report.outcome, RunOutcome::Stopped);
    assert!(done.load(Ordering::SeqCst) < 1000);
}

#[test]
fn test_configured_accounts_run_concurrently() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[plugins]
sources = ["plugins/daily"]
enabled = ["daily_entrust", "daily_mail"]

[plugins.settings.daily_mail]
template = "claim"

[scheduler]
default_strategy = "skip"
pause_poll_ms = 20

[[accounts]]
account = "main"
endpoint = "127.0.0.1:16384"

[[accounts]]
account = "alt"
endpoint = "127.0.0.1:16416"
"#
    )
    .unwrap();
    let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
    assert_eq!(cfg.scheduler.pause_poll(), Duration::from_millis(20));
    let settings = PluginSettings::from_config(&cfg);
    assert_eq!(settings.get::<String>("daily_mail", "template").as_deref(), Some("claim"));

    let pool = SchedulerPool::new();
    let mut devices = Vec::new();
    for account in &cfg.accounts {
        let device = FakeDevice::online();
        devices.push(Arc::clone(&device));
        let ctx = ExecutionContext::builder(&account.account, &account.endpoint)
            .device(device)
            .vision(Arc::new(FakeVision))
            .settings(settings.clone())
            .build();
        let registry = PluginRegistry::from_config(ctx, daily_catalog(), &cfg.plugins);
        registry.load(cfg.plugins.sources.as_slice()).unwrap();
        let resolver = ErrorResolver::from_config(&cfg.scheduler).unwrap();
        pool.insert(TaskScheduler::from_registry(&registry, Arc::new(resolver)));
    }

    assert_eq!(pool.start_all().unwrap(), 2);
    let reports = pool.join_all();
    assert_eq!(reports.len(), 2);
    for (account, report) in reports {
        let report = report.unwrap();
        assert_eq!(report.account, account);
        assert_eq!(report.executed(), vec!["daily_entrust", "daily_mail"]);
    }
    assert!(devices.iter().all(|d| d.clicks.load(Ordering::SeqCst) == 2));
    assert!(pool
        .states()
        .values()
        .all(|s| *s == SchedulerState::Completed));
}

#[test]
fn test_failed_construction_reported_after_full_load() {
    let ctx = context("main", FakeDevice::online());
    let mut catalog = daily_catalog();
    catalog.register("plugins/daily/broken_plugin", |_load| {
        Err(PluginFault::custom("template", "missing template pack"))
    });
    let registry = PluginRegistry::new(ctx, catalog);

    let err = registry.load(&["plugins/daily"]).unwrap_err();
    match err {
        HiveError::Load(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].source_id, "plugins/daily/broken_plugin");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(registry.len(), 3);
}
