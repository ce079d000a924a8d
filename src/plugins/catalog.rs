//! 插件目录：静态注册表取代运行时目录扫描
//!
//! 每个「来源单元」以路径式 id 标识（如 `plugins/daily/entrust_plugin`），导出一个或多个插件工厂。
//! 配置中的来源若恰好是某个单元则直接加载；若是一棵子树，则加载其下末段以 `_plugin` 结尾的所有单元。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::{ExecutionContext, PluginFault};
use crate::plugins::{Plugin, PluginRegistry};

/// 子树发现时识别插件单元的命名约定
pub const PLUGIN_SUFFIX: &str = "_plugin";

/// 工厂实例化插件时可见的环境；registry 允许在注册过程中查找已注册的插件
pub struct LoadContext<'a> {
    pub context: &'a ExecutionContext,
    pub registry: &'a PluginRegistry,
}

pub type PluginFactory =
    Arc<dyn Fn(&LoadContext<'_>) -> Result<Arc<dyn Plugin>, PluginFault> + Send + Sync>;

/// 来源单元 → 插件工厂
#[derive(Clone, Default)]
pub struct PluginCatalog {
    units: BTreeMap<String, Vec<PluginFactory>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为单元追加一个工厂
    pub fn register<F>(&mut self, unit: &str, factory: F) -> &mut Self
    where
        F: Fn(&LoadContext<'_>) -> Result<Arc<dyn Plugin>, PluginFault> + Send + Sync + 'static,
    {
        self.units
            .entry(canonicalize(unit))
            .or_default()
            .push(Arc::new(factory));
        self
    }

    /// 构造不会失败的插件
    pub fn register_plugin<P, F>(&mut self, unit: &str, ctor: F) -> &mut Self
    where
        P: Plugin + 'static,
        F: Fn(&ExecutionContext) -> P + Send + Sync + 'static,
    {
        self.register(unit, move |load| Ok(Arc::new(ctor(load.context)) as Arc<dyn Plugin>))
    }

    pub fn with_plugin<P, F>(mut self, unit: &str, ctor: F) -> Self
    where
        P: Plugin + 'static,
        F: Fn(&ExecutionContext) -> P + Send + Sync + 'static,
    {
        self.register_plugin(unit, ctor);
        self
    }

    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    pub(crate) fn factories(&self, unit: &str) -> &[PluginFactory] {
        self.units.get(unit).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 将配置来源解析为规范化的单元 id 列表（有序）
    pub fn resolve(&self, source: &str) -> Vec<String> {
        let canonical = canonicalize(source);
        if self.units.contains_key(&canonical) {
            return vec![canonical];
        }

        let prefix = if canonical.is_empty() {
            String::new()
        } else {
            format!("{canonical}/")
        };
        self.units
            .keys()
            .filter(|unit| unit.starts_with(&prefix))
            .filter(|unit| {
                unit.rsplit('/')
                    .next()
                    .map(|last| last.ends_with(PLUGIN_SUFFIX))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// 规范化来源 id：统一分隔符，去掉 `.`、空段与尾部斜杠，处理 `..`
pub fn canonicalize(source: &str) -> String {
    let normalized = source.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p.strip_suffix(".rs").unwrap_or(p)),
        }
    }
    parts.join("/")
}
