//! 运行记录：一次执行的结果（成功附步骤轨迹，失败附错误描述），不持久化

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Strategy;

/// 步骤轨迹中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: String,
    pub detail: Value,
    pub at: i64,
}

/// 插件 execute 返回的结构化轨迹
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一步
    pub fn step(&mut self, step: impl Into<String>, detail: Value) -> &mut Self {
        self.steps.push(TraceStep {
            step: step.into(),
            detail,
            at: chrono::Utc::now().timestamp_millis(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// 一次执行的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub status: RunStatus,
    pub plugin: String,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// execute 的调用次数（含重试）
    pub attempts: u32,
    /// 失败后实际采用的策略
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub duration_ms: u64,
}

impl RunRecord {
    pub fn success(plugin: impl Into<String>, account: impl Into<String>, trace: Trace) -> Self {
        Self {
            status: RunStatus::Success,
            plugin: plugin.into(),
            account: account.into(),
            trace: Some(trace),
            error: None,
            attempts: 1,
            strategy: None,
            duration_ms: 0,
        }
    }

    pub fn failure(
        plugin: impl Into<String>,
        account: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: RunStatus::Error,
            plugin: plugin.into(),
            account: account.into(),
            trace: None,
            error: Some(error.into()),
            attempts: 1,
            strategy: None,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
