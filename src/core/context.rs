//! 执行上下文（账号 + 端点）与外部协作者接口
//!
//! 设备控制、视觉识别均由嵌入方实现；核心只转交句柄，从不解释坐标或文字。

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PluginSettings;
use crate::core::cache::Resource;

/// 截图
#[derive(Clone, Default)]
pub struct Screenshot {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screenshot")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// 模板匹配结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementMatch {
    pub x: i32,
    pub y: i32,
    pub confidence: f32,
}

/// OCR 识别出的一段文字
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub text: String,
    /// 左上、右下
    pub bounds: [(i32, i32); 2],
    pub score: f32,
}

/// 设备控制协作者
pub trait DeviceControl: Send + Sync {
    fn connect(&self) -> anyhow::Result<()>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn click(&self, x: i32, y: i32) -> anyhow::Result<()>;
    fn screenshot(&self) -> anyhow::Result<Screenshot>;
}

/// 视觉 / OCR 协作者
pub trait Vision: Send + Sync {
    fn find_element(&self, image: &Screenshot, template: &str) -> Option<ElementMatch>;
    fn recognize_text(&self, image: &Screenshot) -> Vec<TextItem>;
}

/// 设备 + 视觉句柄组合，缓存于 ResourceCache，释放时断开设备
pub struct DeviceSession {
    pub device: Arc<dyn DeviceControl>,
    pub vision: Arc<dyn Vision>,
}

impl DeviceSession {
    pub fn new(device: Arc<dyn DeviceControl>, vision: Arc<dyn Vision>) -> Self {
        Self { device, vision }
    }
}

impl Resource for DeviceSession {
    fn cleanup(&self) {
        self.device.disconnect();
    }
}

struct ContextInner {
    account: String,
    endpoint: String,
    span: tracing::Span,
    device: Option<Arc<dyn DeviceControl>>,
    vision: Option<Arc<dyn Vision>>,
    settings: PluginSettings,
}

/// 账号级执行上下文（adapter）：由调用方创建与销毁，核心只借用
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("account", &self.inner.account)
            .field("endpoint", &self.inner.endpoint)
            .field("device", &self.inner.device.is_some())
            .field("vision", &self.inner.vision.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub fn builder(account: impl Into<String>, endpoint: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            account: account.into(),
            endpoint: endpoint.into(),
            device: None,
            vision: None,
            settings: PluginSettings::default(),
        }
    }

    pub fn account(&self) -> &str {
        &self.inner.account
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// 带 account / endpoint 字段的 span，插件与调度器日志都在其内输出
    pub fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceControl>> {
        self.inner.device.as_ref()
    }

    pub fn vision(&self) -> Option<&Arc<dyn Vision>> {
        self.inner.vision.as_ref()
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.inner.settings
    }

    /// 设备已挂载且处于连接状态
    pub fn is_available(&self) -> bool {
        self.inner
            .device
            .as_ref()
            .map(|d| d.is_connected())
            .unwrap_or(false)
    }
}

pub struct ContextBuilder {
    account: String,
    endpoint: String,
    device: Option<Arc<dyn DeviceControl>>,
    vision: Option<Arc<dyn Vision>>,
    settings: PluginSettings,
}

impl ContextBuilder {
    pub fn device(mut self, device: Arc<dyn DeviceControl>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn vision(mut self, vision: Arc<dyn Vision>) -> Self {
        self.vision = Some(vision);
        self
    }

    /// 从缓存的 DeviceSession 挂载设备与视觉句柄
    pub fn session(self, session: &DeviceSession) -> Self {
        self.device(Arc::clone(&session.device))
            .vision(Arc::clone(&session.vision))
    }

    pub fn settings(mut self, settings: PluginSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> ExecutionContext {
        let span = tracing::info_span!(
            "account",
            account = %self.account,
            endpoint = %self.endpoint
        );
        ExecutionContext {
            inner: Arc::new(ContextInner {
                account: self.account,
                endpoint: self.endpoint,
                span,
                device: self.device,
                vision: self.vision,
                settings: self.settings,
            }),
        }
    }
}
