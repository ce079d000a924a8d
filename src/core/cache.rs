//! 资源实例缓存：按（端点, 账号, 调用线程）缓存昂贵对象
//!
//! 线程标识是键的一部分，并发运行的账号工作线程之间绝不共享设备控制状态。
//! 所有变更都在同一把锁内完成；新实例在持锁期间构造，同键不会重复构造。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::core::HiveError;

/// 可缓存资源：释放时调用 cleanup（恰好一次）
pub trait Resource: Send + Sync {
    fn cleanup(&self);
}

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub endpoint: String,
    pub account: String,
    pub thread: ThreadId,
}

impl ResourceKey {
    /// 以当前线程构造键
    pub fn current(endpoint: &str, account: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            account: account.to_string(),
            thread: thread::current().id(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:?}_{}", self.endpoint, self.thread, self.account)
    }
}

type Factory<R> = Box<dyn Fn(&ResourceKey) -> anyhow::Result<R> + Send + Sync>;

/// 线程作用域的资源缓存；缓存独占所有实例，调用方只持有 Arc
pub struct ResourceCache<R: Resource> {
    instances: Mutex<HashMap<ResourceKey, Arc<R>>>,
    factory: Factory<R>,
}

impl<R: Resource> ResourceCache<R> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&ResourceKey) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        Self {
            instances: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// 获取当前线程的实例；首次访问时构造
    pub fn acquire(&self, endpoint: &str, account: &str) -> Result<Arc<R>, HiveError> {
        let key = ResourceKey::current(endpoint, account);
        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let instance = (self.factory)(&key).map_err(|source| HiveError::Resource {
            key: key.to_string(),
            source: source.into(),
        })?;
        tracing::debug!(key = %key, "resource instance created");
        let instance = Arc::new(instance);
        instances.insert(key, Arc::clone(&instance));
        Ok(instance)
    }

    /// 释放当前线程的实例；键不存在时为空操作。返回是否释放了实例
    pub fn release(&self, endpoint: &str, account: &str) -> bool {
        let key = ResourceKey::current(endpoint, account);
        // 先出锁再 cleanup，cleanup 可能回访缓存
        let removed = self.instances.lock().remove(&key);
        match removed {
            Some(instance) => {
                instance.cleanup();
                tracing::debug!(key = %key, "resource instance released");
                true
            }
            None => false,
        }
    }

    /// 释放所有线程的所有实例（进程退出）
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.instances.lock().drain().collect();
        let count = drained.len();
        for (key, instance) in drained {
            instance.cleanup();
            tracing::debug!(key = %key, "resource instance released");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Resource> Drop for ResourceCache<R> {
    fn drop(&mut self) {
        self.release_all();
    }
}
