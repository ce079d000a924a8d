//! 可观测性：tracing 订阅器初始化
//!
//! 每个账号的日志通过 ExecutionContext 的 span（account / endpoint 字段）区分，无需按账号拆分 logger。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；RUST_LOG 优先于传入的默认级别。重复调用无副作用。
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init();
}
