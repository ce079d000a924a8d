//! 插件注册表
//!
//! 从 PluginCatalog 解析配置来源，实例化插件，按启用列表过滤，setup 成功后才对 get / list 可见。
//! 重名注册会覆盖旧条目并告警。锁可重入：工厂与 setup 期间可以回查注册表。

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::config::PluginsSection;
use crate::core::{ExecutionContext, FailureKind, HiveError, LoadFailure, PluginFault};
use crate::plugins::executor::panic_message;
use crate::plugins::{LoadContext, Plugin, PluginCatalog, PluginDescriptor};

/// 注册结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Registered,
    /// 覆盖了同名的旧条目
    Replaced,
    /// 不在启用列表中
    Skipped,
}

/// 一次 load 的汇总
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// 本次新加载的来源单元
    pub units: Vec<String>,
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
}

struct Entry {
    plugin: Arc<dyn Plugin>,
    /// 注册顺序，list 同优先级时按此排序
    seq: u64,
}

#[derive(Default)]
struct RegistryState {
    plugins: HashMap<String, Entry>,
    loaded_units: HashSet<String>,
    next_seq: u64,
}

/// 插件注册表：由应用顶层显式构造并按引用传递
pub struct PluginRegistry {
    context: ExecutionContext,
    catalog: PluginCatalog,
    enabled: Option<HashSet<String>>,
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl PluginRegistry {
    pub fn new(context: ExecutionContext, catalog: PluginCatalog) -> Self {
        Self {
            context,
            catalog,
            enabled: None,
            state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
        }
    }

    /// 只接纳启用列表中的插件名
    pub fn with_enabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn from_config(
        context: ExecutionContext,
        catalog: PluginCatalog,
        section: &PluginsSection,
    ) -> Self {
        let registry = Self::new(context, catalog);
        match &section.enabled {
            Some(names) => registry.with_enabled(names.iter().cloned()),
            None => registry,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled
            .as_ref()
            .map(|names| names.contains(name))
            .unwrap_or(true)
    }

    /// 加载来源；每个规范化单元只加载一次，重复调用幂等。
    ///
    /// 单个插件失败不影响其余插件；全部处理完后若有失败，返回 `HiveError::Load`。
    pub fn load<S: AsRef<str>>(&self, sources: &[S]) -> Result<LoadReport, HiveError> {
        let guard = self.state.lock();
        let mut report = LoadReport::default();
        let mut failures = Vec::new();

        for source in sources {
            let source = source.as_ref();
            let units = self.catalog.resolve(source);
            if units.is_empty() {
                tracing::warn!(source = %source, "plugin source matched no units");
            }

            for unit in units {
                if !guard.borrow_mut().loaded_units.insert(unit.clone()) {
                    continue;
                }
                report.units.push(unit.clone());

                for factory in self.catalog.factories(&unit) {
                    let load = LoadContext {
                        context: &self.context,
                        registry: self,
                    };
                    let plugin = match contained("construction", || factory(&load)) {
                        Ok(plugin) => plugin,
                        Err(fault) => {
                            tracing::error!(unit = %unit, error = %fault, "plugin construction failed");
                            failures.push(LoadFailure {
                                plugin: unit.clone(),
                                source_id: unit.clone(),
                                reason: fault.to_string(),
                            });
                            continue;
                        }
                    };

                    let name = plugin.name().to_string();
                    match self.admit(plugin, &unit) {
                        Ok(Admission::Skipped) => report.skipped.push(name),
                        Ok(_) => report.registered.push(name),
                        Err(failure) => failures.push(failure),
                    }
                }
            }
        }

        tracing::info!(
            units = report.units.len(),
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            failed = failures.len(),
            "plugins loaded"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(HiveError::Load(failures))
        }
    }

    /// 显式注册单个插件（不经过目录）
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<Admission, HiveError> {
        self.admit(plugin, "<explicit>")
            .map_err(|failure| HiveError::Load(vec![failure]))
    }

    fn admit(&self, plugin: Arc<dyn Plugin>, source_id: &str) -> Result<Admission, LoadFailure> {
        let guard = self.state.lock();
        let name = plugin.name().to_string();

        if !self.is_enabled(&name) {
            tracing::info!(plugin = %name, "plugin not in enable-list, skipped");
            return Ok(Admission::Skipped);
        }

        if let Err(fault) = contained("setup", || plugin.setup()) {
            tracing::error!(plugin = %name, error = %fault, "plugin setup failed");
            return Err(LoadFailure {
                plugin: name,
                source_id: source_id.to_string(),
                reason: fault.to_string(),
            });
        }

        let mut state = guard.borrow_mut();
        let seq = state.next_seq;
        state.next_seq += 1;
        let replaced = state
            .plugins
            .insert(name.clone(), Entry { plugin, seq })
            .is_some();

        if replaced {
            tracing::warn!(plugin = %name, "plugin already registered, overwritten");
            Ok(Admission::Replaced)
        } else {
            tracing::info!(plugin = %name, source = %source_id, "plugin registered");
            Ok(Admission::Registered)
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.plugins.get(name).map(|e| Arc::clone(&e.plugin))
    }

    /// 按优先级升序；同优先级按注册顺序
    pub fn list(&self) -> Vec<Arc<dyn Plugin>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let mut entries: Vec<&Entry> = state.plugins.values().collect();
        entries.sort_by_key(|e| (e.plugin.priority(), e.seq));
        entries.into_iter().map(|e| Arc::clone(&e.plugin)).collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<Arc<dyn Plugin>> {
        self.list()
            .into_iter()
            .filter(|p| p.category() == category)
            .collect()
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.list().iter().map(|p| p.descriptor()).collect()
    }

    /// 卸载：先 stop 再 teardown，成功后移除。teardown 失败时保留条目并返回 false
    pub fn unload(&self, name: &str) -> bool {
        let guard = self.state.lock();
        let plugin = match guard.borrow().plugins.get(name) {
            Some(entry) => Arc::clone(&entry.plugin),
            None => {
                tracing::warn!(plugin = %name, "unload: plugin not registered");
                return false;
            }
        };

        plugin.stop();
        match contained("teardown", || plugin.teardown()) {
            Ok(()) => {
                guard.borrow_mut().plugins.remove(name);
                tracing::info!(plugin = %name, "plugin unloaded");
                true
            }
            Err(fault) => {
                tracing::error!(plugin = %name, error = %fault, "plugin teardown failed, entry kept");
                false
            }
        }
    }

    /// 卸载全部，返回成功卸载的数量
    pub fn unload_all(&self) -> usize {
        let guard = self.state.lock();
        let names: Vec<String> = guard.borrow().plugins.keys().cloned().collect();
        names.iter().filter(|name| self.unload(name)).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().borrow().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 插件代码中的 panic 转为 Panic 类失败，只影响该插件
fn contained<T>(
    stage: &str,
    f: impl FnOnce() -> Result<T, PluginFault>,
) -> Result<T, PluginFault> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(PluginFault::new(
            FailureKind::Panic,
            format!("{stage} panicked: {}", panic_message(payload.as_ref())),
        ))
    })
}
