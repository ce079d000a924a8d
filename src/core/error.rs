//! 错误类型与恢复策略
//!
//! 与 ErrorResolver 配合：根据 HiveError 的 FailureKind 决定 Wait / Skip / Retry / Stop。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 失败类别：ErrorResolver 按类别精确匹配处理器
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 视觉识别未找到目标元素
    ElementNotFound,
    /// 设备控制失败（断连、点击失败等）
    Device,
    Timeout,
    /// 插件响应 stop() 后中止
    Stopped,
    /// execute 内部 panic
    Panic,
    NotFound,
    NotReady,
    Custom(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementNotFound => write!(f, "element_not_found"),
            Self::Device => write!(f, "device"),
            Self::Timeout => write!(f, "timeout"),
            Self::Stopped => write!(f, "stopped"),
            Self::Panic => write!(f, "panic"),
            Self::NotFound => write!(f, "not_found"),
            Self::NotReady => write!(f, "not_ready"),
            Self::Custom(kind) => write!(f, "{kind}"),
        }
    }
}

/// 插件自身抛出的错误（execute / setup / teardown）
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct PluginFault {
    pub kind: FailureKind,
    pub message: String,
}

impl PluginFault {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn element_not_found(template: impl Into<String>) -> Self {
        Self::new(FailureKind::ElementNotFound, template)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Device, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn stopped() -> Self {
        Self::new(FailureKind::Stopped, "stop requested")
    }

    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Custom(kind.into()), message)
    }
}

impl From<anyhow::Error> for PluginFault {
    fn from(err: anyhow::Error) -> Self {
        Self::custom("error", format!("{err:#}"))
    }
}

/// 单个插件的加载失败记录
#[derive(Debug, Clone)]
pub struct LoadFailure {
    /// 插件名；构造阶段失败时为来源单元 id
    pub plugin: String,
    pub source_id: String,
    pub reason: String,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.plugin, self.source_id, self.reason)
    }
}

fn join_failures(failures: &[LoadFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    /// 一个或多个插件加载失败；其余插件不受影响
    #[error("Plugin load failed: {}", join_failures(.0))]
    Load(Vec<LoadFailure>),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin not ready: {0}")]
    NotReady(String),

    #[error("Plugin {plugin} execution failed: {source}")]
    Execution {
        plugin: String,
        #[source]
        source: PluginFault,
    },

    /// 无处理器、无交互协作者、无默认策略
    #[error("No recovery policy for {plugin} ({kind})")]
    PolicyResolution { plugin: String, kind: FailureKind },

    #[error("Resource error for {key}: {source}")]
    Resource {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Scheduler worker error: {0}")]
    Worker(String),
}

impl HiveError {
    /// 失败类别（ErrorResolver 的分派键）
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound(_) => FailureKind::NotFound,
            Self::NotReady(_) => FailureKind::NotReady,
            Self::Execution { source, .. } => source.kind.clone(),
            Self::Load(_) => FailureKind::Custom("load".into()),
            Self::PolicyResolution { kind, .. } => kind.clone(),
            Self::Resource { .. } => FailureKind::Device,
            Self::Config(_) => FailureKind::Custom("config".into()),
            Self::Worker(_) => FailureKind::Custom("worker".into()),
        }
    }

    /// 相关插件名（若有）
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::NotFound(name) | Self::NotReady(name) => Some(name),
            Self::Execution { plugin, .. } | Self::PolicyResolution { plugin, .. } => Some(plugin),
            _ => None,
        }
    }
}

/// 失败的恢复策略；只作用于本次失败，不跨插件保留
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// 暂停推进，等待外部 resume
    Wait,
    /// 跳过当前插件
    Skip,
    /// 再执行一次（仅一次）
    Retry,
    /// 终止整个运行
    Stop,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::Skip => "skip",
            Self::Retry => "retry",
            Self::Stop => "stop",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Strategy {
    type Err = HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "skip" => Ok(Self::Skip),
            "retry" => Ok(Self::Retry),
            "stop" => Ok(Self::Stop),
            other => Err(HiveError::Config(format!("unknown strategy: {other}"))),
        }
    }
}
