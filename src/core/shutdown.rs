//! 优雅关闭
//!
//! Ctrl+C / SIGTERM / 致命错误都收敛为一次取消；drain 随后停止调度器池并等待各账号的运行收尾。

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{HiveError, RunReport, SchedulerPool};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或上层界面退出
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：只记录第一次触发的原因
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut first = self.reason.lock();
            if first.is_some() {
                return;
            }
            tracing::info!(reason = ?reason, "shutdown triggered");
            *first = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// signal 完成时以 reason 触发关闭；关闭先发生时任务直接结束
    pub fn shutdown_on<F>(&self, signal: F, reason: ShutdownReason) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal => manager.shutdown(reason),
                _ = manager.token.cancelled() => {}
            }
        })
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理；需在 tokio 运行时内调用
    pub fn install_signal_handlers(&self) {
        self.shutdown_on(
            async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            },
            ShutdownReason::UserInitiated,
        );

        #[cfg(unix)]
        self.shutdown_on(
            async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(_) => std::future::pending::<()>().await,
                }
            },
            ShutdownReason::Signal,
        );
    }

    /// 等待关闭信号，停止池中所有调度器，并等待各工作线程退出
    pub async fn drain(
        &self,
        pool: Arc<SchedulerPool>,
    ) -> Result<Vec<(String, Result<RunReport, HiveError>)>, HiveError> {
        self.wait_for_shutdown().await;
        tracing::info!(schedulers = pool.len(), reason = ?self.reason(), "stopping all schedulers");
        pool.stop_all();
        tokio::task::spawn_blocking(move || pool.join_all())
            .await
            .map_err(|e| HiveError::Worker(e.to_string()))
    }
}
