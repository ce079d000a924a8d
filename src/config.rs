//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKHIVE__*` 覆盖（双下划线表示嵌套，如 `TASKHIVE__SCHEDULER__DEFAULT_STRATEGY=skip`）。
//! 引擎只在加载时读取一次，不回写。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::{HiveError, Strategy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub plugins: PluginsSection,
    pub scheduler: SchedulerSection,
    pub log: LogSection,
    /// 每个账号一个调度器
    pub accounts: Vec<AccountEntry>,
}

/// [plugins] 段：插件来源、启用列表、各插件设置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    pub sources: Vec<String>,
    /// 启用列表；未配置时加载全部发现的插件
    pub enabled: Option<Vec<String>>,
    /// [plugins.settings.<name>] 任意嵌套键值
    pub settings: HashMap<String, Map<String, Value>>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            enabled: None,
            settings: HashMap::new(),
        }
    }
}

fn default_sources() -> Vec<String> {
    vec!["plugins".to_string()]
}

/// [scheduler] 段：默认恢复策略与暂停轮询间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// wait / skip / retry / stop；"none" 表示不设兜底策略
    pub default_strategy: String,
    pub pause_poll_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_strategy: "wait".to_string(),
            pause_poll_ms: 100,
        }
    }
}

impl SchedulerSection {
    /// 解析兜底策略；"none" 或空串返回 None
    pub fn default_strategy(&self) -> Result<Option<Strategy>, HiveError> {
        match self.default_strategy.trim() {
            "" | "none" => Ok(None),
            s => s.parse().map(Some),
        }
    }

    /// 插件 RunControl 的暂停轮询间隔
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }
}

/// [log] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// [[accounts]]：账号与设备端点
#[derive(Debug, Clone, Deserialize)]
pub struct AccountEntry {
    pub account: String,
    pub endpoint: String,
}

/// 插件设置的只读视图，随 ExecutionContext 共享
#[derive(Debug, Clone, Default)]
pub struct PluginSettings {
    inner: Arc<HashMap<String, Map<String, Value>>>,
}

impl PluginSettings {
    pub fn new(settings: HashMap<String, Map<String, Value>>) -> Self {
        Self {
            inner: Arc::new(settings),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.plugins.settings.clone())
    }

    /// 读取某插件的某项设置并反序列化；缺失或类型不符返回 None
    pub fn get<T: serde::de::DeserializeOwned>(&self, plugin: &str, key: &str) -> Option<T> {
        self.inner
            .get(plugin)
            .and_then(|m| m.get(key))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn section(&self, plugin: &str) -> Option<&Map<String, Value>> {
        self.inner.get(plugin)
    }
}

/// 从 config 目录加载配置，环境变量 TASKHIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKHIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKHIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.plugins.sources, vec!["plugins".to_string()]);
        assert!(cfg.plugins.enabled.is_none());
        assert_eq!(cfg.scheduler.default_strategy().unwrap(), Some(Strategy::Wait));
        assert_eq!(cfg.scheduler.pause_poll_ms, 100);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[plugins]
sources = ["plugins/daily"]
enabled = ["daily_entrust"]

[plugins.settings.daily_entrust]
retry_count = 3
slots = ["a", "b"]

[scheduler]
default_strategy = "skip"

[[accounts]]
account = "main"
endpoint = "127.0.0.1:16384"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.plugins.sources, vec!["plugins/daily".to_string()]);
        assert_eq!(cfg.plugins.enabled, Some(vec!["daily_entrust".to_string()]));
        assert_eq!(cfg.scheduler.default_strategy().unwrap(), Some(Strategy::Skip));
        assert_eq!(cfg.accounts.len(), 1);
        assert_eq!(cfg.accounts[0].endpoint, "127.0.0.1:16384");

        let settings = PluginSettings::from_config(&cfg);
        assert_eq!(settings.get::<u32>("daily_entrust", "retry_count"), Some(3));
        assert_eq!(
            settings.get::<Vec<String>>("daily_entrust", "slots"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(settings.get::<u32>("daily_mail", "retry_count"), None);
    }

    #[test]
    fn test_no_default_strategy() {
        let section = SchedulerSection {
            default_strategy: "none".into(),
            pause_poll_ms: 10,
        };
        assert_eq!(section.default_strategy().unwrap(), None);

        let bad = SchedulerSection {
            default_strategy: "resolved".into(),
            pause_poll_ms: 10,
        };
        assert!(bad.default_strategy().is_err());
    }
}
