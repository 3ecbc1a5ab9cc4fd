use crate::error::EngineError;
use crate::model::{MonitoredUser, WatchSnapshot};
use crate::watcher::{spawn_watcher, Command, WatchContext, WatcherHandle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 轮询间隔下限
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// 轮询间隔上限，一天
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// 把轮询间隔限制在 [1s, 24h] 内
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}

/// 监控表：账号 -> watcher 任务
///
/// 每个账号的状态只在自己的 watcher 任务里修改，这里只负责
/// 启动、查找和回收这些任务。
pub struct Scheduler {
    ctx: Arc<WatchContext>,
    watchers: Mutex<HashMap<String, Arc<WatchEntry>>>,
    poll_interval: watch::Sender<Duration>,
    shutdown: CancellationToken,
}

struct WatchEntry {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<WatchSnapshot>,
    /// 移除时取走并等待结束；None 表示正在移除
    handle: tokio::sync::Mutex<Option<WatcherHandle>>,
}

impl Scheduler {
    pub fn new(
        ctx: Arc<WatchContext>,
        poll_interval: watch::Sender<Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            watchers: Mutex::new(HashMap::new()),
            poll_interval,
            shutdown,
        }
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, Arc<WatchEntry>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.watchers().contains_key(handle)
    }

    /// 为账号启动独立的 watcher 任务
    pub fn add_user(&self, user: MonitoredUser) -> Result<WatchSnapshot, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let mut watchers = self.watchers();
        if watchers.contains_key(&user.handle) {
            return Err(EngineError::AlreadyWatched(user.handle));
        }

        let handle = user.handle.clone();
        let watcher = spawn_watcher(user, self.ctx.clone(), self.shutdown.child_token());
        let entry = WatchEntry {
            commands: watcher.commands(),
            snapshot: watcher.subscribe(),
            handle: tokio::sync::Mutex::new(Some(watcher)),
        };
        let snapshot = entry.snapshot.borrow().clone();
        watchers.insert(handle.clone(), Arc::new(entry));
        info!("Added @{} ({} watched)", handle, watchers.len());
        Ok(snapshot)
    }

    /// 先停止 watcher (及其录制) 再删除条目
    pub async fn remove_user(&self, handle: &str) -> Result<(), EngineError> {
        let entry = self
            .watchers()
            .get(handle)
            .cloned()
            .ok_or_else(|| EngineError::UnknownUser(handle.to_string()))?;

        let watcher = entry.handle.lock().await.take();
        match watcher {
            Some(watcher) => watcher.stop().await,
            // 另一个请求正在移除
            None => return Err(EngineError::UnknownUser(handle.to_string())),
        }

        self.watchers().remove(handle);
        info!("Removed @{}", handle);
        Ok(())
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Duration {
        let interval = clamp_poll_interval(interval);
        self.poll_interval.send_replace(interval);
        info!("Poll interval set to {}s", interval.as_secs());
        interval
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.borrow()
    }

    pub fn commands(&self, handle: &str) -> Result<mpsc::Sender<Command>, EngineError> {
        self.watchers()
            .get(handle)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| EngineError::UnknownUser(handle.to_string()))
    }

    pub fn snapshot(&self, handle: &str) -> Option<WatchSnapshot> {
        self.watchers()
            .get(handle)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    /// 按账号排序
    pub fn snapshots(&self) -> Vec<WatchSnapshot> {
        let mut all: Vec<WatchSnapshot> = self
            .watchers()
            .values()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        all.sort_by(|a, b| a.handle.cmp(&b.handle));
        all
    }

    pub fn len(&self) -> usize {
        self.watchers().len()
    }

    /// 取消所有 watcher，并等待它们结束各自的录制
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let entries: Vec<(String, Arc<WatchEntry>)> = self.watchers().drain().collect();
        let mut stopping = Vec::new();
        for (handle, entry) in entries {
            if let Some(watcher) = entry.handle.lock().await.take() {
                stopping.push(tokio::spawn(async move {
                    watcher.stop().await;
                    handle
                }));
            }
        }
        for task in stopping {
            if let Err(e) = task.await {
                warn!("Watcher shutdown failed: {}", e);
            }
        }
    }
}
