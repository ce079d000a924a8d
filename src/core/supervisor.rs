//! 多账号监管：每个账号一个调度器，彼此独立运行
//!
//! 账号之间不共享运行状态；同一端点/账号的资源在各自的调度线程上分别缓存。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{HiveError, RunReport, SchedulerState, TaskScheduler};

/// 账号 → 调度器
#[derive(Default)]
pub struct SchedulerPool {
    schedulers: RwLock<BTreeMap<String, Arc<TaskScheduler>>>,
}

impl SchedulerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按账号加入；同名账号的旧调度器被替换并返回（不会被停止）
    pub fn insert(&self, scheduler: TaskScheduler) -> Option<Arc<TaskScheduler>> {
        let account = scheduler.account().to_string();
        self.schedulers.write().insert(account, Arc::new(scheduler))
    }

    pub fn get(&self, account: &str) -> Option<Arc<TaskScheduler>> {
        self.schedulers.read().get(account).cloned()
    }

    pub fn accounts(&self) -> Vec<String> {
        self.schedulers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.schedulers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<TaskScheduler>> {
        self.schedulers.read().values().cloned().collect()
    }

    /// 启动所有调度器，返回本次实际启动的数量；遇到线程创建失败立即返回
    pub fn start_all(&self) -> Result<usize, HiveError> {
        let mut started = 0;
        for scheduler in self.snapshot() {
            if scheduler.start()? {
                started += 1;
            }
        }
        tracing::info!(started, total = self.len(), "schedulers started");
        Ok(started)
    }

    pub fn stop_all(&self) {
        for scheduler in self.snapshot() {
            scheduler.stop();
        }
    }

    pub fn pause_all(&self) {
        for scheduler in self.snapshot() {
            scheduler.pause();
        }
    }

    pub fn resume_all(&self) {
        for scheduler in self.snapshot() {
            scheduler.resume();
        }
    }

    pub fn states(&self) -> BTreeMap<String, SchedulerState> {
        self.schedulers
            .read()
            .iter()
            .map(|(account, s)| (account.clone(), s.state()))
            .collect()
    }

    /// 阻塞等待所有调度器结束；异步环境中请放入 spawn_blocking
    pub fn join_all(&self) -> Vec<(String, Result<RunReport, HiveError>)> {
        self.snapshot()
            .into_iter()
            .map(|s| (s.account().to_string(), s.join()))
            .collect()
    }
}
