//! 插件执行器
//!
//! 在失败边界内执行单个插件：未注册返回 NotFound，未就绪返回 NotReady；
//! execute 的错误与 panic 都转为 ExecutionError（带插件名与原因）。运行标志在任何退出路径上清除。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::core::{FailureKind, HiveError, PluginFault};
use crate::plugins::{Plugin, PluginArgs, PluginRegistry, RunRecord};

/// 插件执行器：按名称从注册表查找并执行
pub struct PluginExecutor {
    registry: Arc<PluginRegistry>,
}

impl PluginExecutor {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// 按名称执行
    pub fn run(&self, name: &str, args: &PluginArgs) -> Result<RunRecord, HiveError> {
        let plugin = self
            .registry
            .get(name)
            .ok_or_else(|| HiveError::NotFound(name.to_string()))?;
        Self::invoke(plugin.as_ref(), args)
    }

    /// 按优先级升序依次执行给定插件，单个失败不影响后续；未注册的名称被忽略
    pub fn run_by_priority(
        &self,
        names: &[&str],
        args: &PluginArgs,
    ) -> Vec<(String, Result<RunRecord, HiveError>)> {
        let mut plugins: Vec<Arc<dyn Plugin>> =
            names.iter().filter_map(|n| self.registry.get(n)).collect();
        plugins.sort_by_key(|p| p.priority());

        plugins
            .iter()
            .map(|plugin| {
                let result = Self::invoke(plugin.as_ref(), args);
                if let Err(e) = &result {
                    tracing::error!(plugin = %plugin.name(), error = %e, "plugin failed");
                }
                (plugin.name().to_string(), result)
            })
            .collect()
    }

    /// 失败边界：调度器与 run 共用
    pub fn invoke(plugin: &dyn Plugin, args: &PluginArgs) -> Result<RunRecord, HiveError> {
        Self::invoke_gated(plugin, args, || true)
    }

    /// 运行标志置位后再询问 proceed；返回 false 时不执行，按 Stopped 失败处理。
    /// 调度器借此关闭「stop 落在 begin 之前」的窗口。
    pub(crate) fn invoke_gated<G>(
        plugin: &dyn Plugin,
        args: &PluginArgs,
        proceed: G,
    ) -> Result<RunRecord, HiveError>
    where
        G: Fn() -> bool,
    {
        let name = plugin.name().to_string();
        let ctx = plugin.context();
        let _span = ctx.span().enter();

        match panic::catch_unwind(AssertUnwindSafe(|| plugin.can_execute(args))) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(plugin = %name, "plugin not ready");
                return Err(HiveError::NotReady(name));
            }
            Err(payload) => {
                let message = format!("can_execute panicked: {}", panic_message(payload.as_ref()));
                tracing::error!(plugin = %name, error = %message, "readiness check panicked");
                return Err(HiveError::Execution {
                    plugin: name,
                    source: PluginFault::new(FailureKind::Panic, message),
                });
            }
        }

        let start = Instant::now();
        let outcome = {
            let _running = plugin.control().begin();
            if proceed() {
                tracing::info!(plugin = %name, "plugin started");
                panic::catch_unwind(AssertUnwindSafe(|| plugin.execute(args)))
            } else {
                Ok(Err(PluginFault::stopped()))
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(trace)) => {
                let mut record = RunRecord::success(&name, ctx.account(), trace);
                record.duration_ms = duration_ms;
                Ok(record)
            }
            Ok(Err(fault)) => Err(HiveError::Execution {
                plugin: name.clone(),
                source: fault,
            }),
            Err(payload) => Err(HiveError::Execution {
                plugin: name.clone(),
                source: PluginFault::new(FailureKind::Panic, panic_message(payload.as_ref())),
            }),
        };

        let audit = serde_json::json!({
            "event": "plugin_audit",
            "plugin": name,
            "account": ctx.account(),
            "ok": result.is_ok(),
            "kind": result.as_ref().err().map(|e| e.kind().to_string()),
            "duration_ms": duration_ms,
        });
        match &result {
            Ok(_) => tracing::info!(audit = %audit, "plugin finished"),
            Err(e) => tracing::error!(audit = %audit, error = %e, "plugin failed"),
        }
        result
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked".to_string()
    }
}
