//! 错误恢复：把一次失败映射为恢复策略
//!
//! 解析顺序：按 FailureKind 精确匹配的处理器 → 交互式协作者（由人决定）→ 配置的默认策略（默认 Wait）。
//! 每次解析相互独立，不记录同一插件的历史失败；有界重试由调度器负责。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerSection;
use crate::core::{ExecutionContext, FailureKind, HiveError, Strategy};

/// 按失败类别注册的处理器
pub type FailureHandler = Arc<dyn Fn(&HiveError, &ExecutionContext) -> Strategy + Send + Sync>;

/// 交给交互式协作者的失败描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub plugin: String,
    pub account: String,
    pub category: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReport {
    pub fn new(failure: &HiveError, ctx: &ExecutionContext, category: Option<&str>) -> Self {
        Self {
            plugin: failure.plugin().unwrap_or("<unknown>").to_string(),
            account: ctx.account().to_string(),
            category: category.map(str::to_string),
            kind: failure.kind(),
            message: failure.to_string(),
        }
    }
}

/// 交互式协作者：生产环境可弹窗询问，测试环境返回预置策略；可能无限期阻塞
pub trait InteractiveResolver: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    /// None 表示无法给出决定（协作者不可用或拒绝）
    fn ask(&self, report: &FailureReport) -> Option<Strategy>;
}

/// 按顺序返回预置策略；用尽后返回 None
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    answers: Mutex<VecDeque<Strategy>>,
    asked: Mutex<Vec<FailureReport>>,
}

impl ScriptedResolver {
    pub fn new<I: IntoIterator<Item = Strategy>>(answers: I) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的询问
    pub fn asked(&self) -> Vec<FailureReport> {
        self.asked.lock().clone()
    }
}

impl InteractiveResolver for ScriptedResolver {
    fn ask(&self, report: &FailureReport) -> Option<Strategy> {
        self.asked.lock().push(report.clone());
        self.answers.lock().pop_front()
    }
}

/// 错误解析器
pub struct ErrorResolver {
    handlers: RwLock<HashMap<FailureKind, FailureHandler>>,
    interactive: Option<Arc<dyn InteractiveResolver>>,
    default_strategy: Option<Strategy>,
}

impl Default for ErrorResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorResolver {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            interactive: None,
            default_strategy: Some(Strategy::Wait),
        }
    }

    pub fn from_config(section: &SchedulerSection) -> Result<Self, HiveError> {
        Ok(Self::new().with_default(section.default_strategy()?))
    }

    pub fn with_interactive(mut self, resolver: Arc<dyn InteractiveResolver>) -> Self {
        self.interactive = Some(resolver);
        self
    }

    /// None 表示不设兜底；此时可能返回 PolicyResolution
    pub fn with_default(mut self, strategy: Option<Strategy>) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn register<F>(&self, kind: FailureKind, handler: F)
    where
        F: Fn(&HiveError, &ExecutionContext) -> Strategy + Send + Sync + 'static,
    {
        self.handlers.write().insert(kind, Arc::new(handler));
    }

    /// 解析失败；category 仅用于交互式协作者的展示
    pub fn resolve(
        &self,
        failure: &HiveError,
        ctx: &ExecutionContext,
        category: Option<&str>,
    ) -> Result<Strategy, HiveError> {
        let kind = failure.kind();
        let plugin = failure.plugin().unwrap_or("<unknown>");

        let handler = self.handlers.read().get(&kind).cloned();
        if let Some(handler) = handler {
            let strategy = handler(failure, ctx);
            tracing::info!(plugin = %plugin, kind = %kind, strategy = %strategy, "resolved by handler");
            return Ok(strategy);
        }

        if let Some(interactive) = self.interactive.as_ref().filter(|i| i.is_available()) {
            let report = FailureReport::new(failure, ctx, category);
            if let Some(strategy) = interactive.ask(&report) {
                tracing::info!(plugin = %plugin, kind = %kind, strategy = %strategy, "resolved interactively");
                return Ok(strategy);
            }
            tracing::warn!(plugin = %plugin, kind = %kind, "interactive resolver gave no answer");
        }

        match self.default_strategy {
            Some(strategy) => {
                tracing::info!(plugin = %plugin, kind = %kind, strategy = %strategy, "resolved by default");
                Ok(strategy)
            }
            None => Err(HiveError::PolicyResolution {
                plugin: plugin.to_string(),
                kind,
            }),
        }
    }
}
