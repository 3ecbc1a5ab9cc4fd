use crate::bus::{EngineEvent, EventBus, Subscription};
use crate::config::{AppConfig, UserConfig};
use crate::error::EngineError;
use crate::model::{
    normalize_handle, MonitoredUser, Phase, Quality, RecordHistoryEntry, RecordOutcome,
    WatchSnapshot,
};
use crate::recording::RecorderLauncher;
use crate::resolver::{AuthContext, Resolver};
use crate::scheduler::{clamp_poll_interval, Scheduler};
use crate::store::{self, Store};
use crate::watcher::{request, Command, WatchContext, WatchSettings};
use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// 录制历史汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingStats {
    pub total_recordings: usize,
    pub completed: usize,
    pub interrupted: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub total_seconds: u64,
    pub watched_users: usize,
    pub active_recordings: usize,
}

/// 控制端入口：所有命令经由这里路由到对应账号的 watcher
pub struct Engine {
    scheduler: Scheduler,
    store: Arc<dyn Store>,
    bus: EventBus,
    auth: watch::Sender<AuthContext>,
    shutdown: CancellationToken,
    finalizers: TaskTracker,
}

impl Engine {
    pub fn new(
        config: &AppConfig,
        resolver: Arc<dyn Resolver>,
        launcher: Arc<dyn RecorderLauncher>,
        store: Arc<dyn Store>,
    ) -> Self {
        let bus = EventBus::new(config.watch.event_buffer);
        let (auth, auth_rx) = watch::channel(AuthContext {
            cookies_file: config.server.cookies_file.clone(),
        });
        let (poll_tx, poll_rx) = watch::channel(clamp_poll_interval(Duration::from_secs(
            config.watch.poll_interval_secs,
        )));
        let settings = WatchSettings::from_config(config);
        let finalizers = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let ctx = Arc::new(WatchContext {
            resolver,
            launcher,
            store: store.clone(),
            bus: bus.clone(),
            auth: auth_rx,
            poll_interval: poll_rx,
            recording_slots: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
            finalizers: finalizers.clone(),
            settings,
        });

        Self {
            scheduler: Scheduler::new(ctx, poll_tx, shutdown.clone()),
            store,
            bus,
            auth,
            shutdown,
            finalizers,
        }
    }

    /// 添加账号并持久化到监控列表
    ///
    /// # 错误处理
    /// - 账号为空或含非法字符时返回 `InvalidHandle`
    /// - 已在监控列表中时返回 `AlreadyWatched`
    pub async fn add_user(&self, raw: &str, quality: Quality) -> Result<WatchSnapshot, EngineError> {
        let handle =
            normalize_handle(raw).ok_or_else(|| EngineError::InvalidHandle(raw.to_string()))?;
        let user = MonitoredUser::new(handle, quality);
        let snapshot = self.scheduler.add_user(user.clone())?;

        // 存储失败不影响监控本身
        if let Err(e) = store::save_user(self.store.as_ref(), &user).await {
            error!("Failed to persist @{}: {:#}", user.handle, e);
        }
        self.bus.publish(EngineEvent::UserAdded {
            handle: user.handle,
        });
        Ok(snapshot)
    }

    /// 移除账号；正在录制时先停止录制
    pub async fn remove_user(&self, raw: &str) -> Result<(), EngineError> {
        let handle = self.known_handle(raw)?;
        self.scheduler.remove_user(&handle).await?;
        if let Err(e) = store::delete_user(self.store.as_ref(), &handle).await {
            error!("Failed to delete @{} from store: {:#}", handle, e);
        }
        self.bus.publish(EngineEvent::UserRemoved { handle });
        Ok(())
    }

    /// 恢复已保存的监控列表，并补上配置文件中新增的账号
    pub async fn restore_watchlist(&self, configured: &[UserConfig]) -> anyhow::Result<usize> {
        let mut users = store::load_watchlist(self.store.as_ref()).await?;
        for cfg in configured {
            let Some(handle) = normalize_handle(&cfg.handle) else {
                warn!("Skipping invalid configured handle {:?}", cfg.handle);
                continue;
            };
            if users.iter().all(|u| u.handle != handle) {
                let user = MonitoredUser::new(handle, cfg.quality);
                store::save_user(self.store.as_ref(), &user).await?;
                users.push(user);
            }
        }

        let mut restored = 0;
        for user in users {
            let handle = user.handle.clone();
            match self.scheduler.add_user(user) {
                Ok(_) => restored += 1,
                Err(e) => warn!("Could not restore @{}: {}", handle, e),
            }
        }
        info!("Restored {} watched users", restored);
        Ok(restored)
    }

    /// 暂停或恢复账号的定时轮询，并写回监控列表
    ///
    /// 暂停不会停止正在进行的录制，手动检查仍然可用。
    pub async fn set_enabled(&self, raw: &str, enabled: bool) -> Result<WatchSnapshot, EngineError> {
        let handle = self.known_handle(raw)?;
        let commands = self.scheduler.commands(&handle)?;
        let user = request(&commands, |reply| Command::SetEnabled(enabled, reply)).await?;
        if let Err(e) = store::save_user(self.store.as_ref(), &user).await {
            error!("Failed to persist @{}: {:#}", user.handle, e);
        }
        self.snapshot(&handle)
    }

    pub async fn check_now(&self, raw: &str) -> Result<(), EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::CheckNow).await
    }

    pub async fn start_recording(&self, raw: &str) -> Result<PathBuf, EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::StartRecording).await
    }

    pub async fn stop_recording(&self, raw: &str) -> Result<RecordOutcome, EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::StopRecording).await
    }

    pub async fn attach_preview(
        &self,
        raw: &str,
    ) -> Result<watch::Receiver<Option<Bytes>>, EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::AttachPreview).await
    }

    pub async fn detach_preview(&self, raw: &str) -> Result<(), EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::DetachPreview).await
    }

    /// 最新的预览帧 (JPEG)
    pub async fn preview_frame(&self, raw: &str) -> Result<Option<Bytes>, EngineError> {
        let commands = self.scheduler.commands(&self.known_handle(raw)?)?;
        request(&commands, Command::PreviewFrame).await
    }

    pub fn set_poll_interval(&self, interval: Duration) -> Duration {
        self.scheduler.set_poll_interval(interval)
    }

    pub fn poll_interval(&self) -> Duration {
        self.scheduler.poll_interval()
    }

    /// 更新 cookies 文件，下一次解析生效
    pub fn set_cookies_file(&self, cookies_file: Option<PathBuf>) {
        info!("Cookies file set to {:?}", cookies_file);
        self.auth.send_replace(AuthContext { cookies_file });
    }

    pub fn cookies_file(&self) -> Option<PathBuf> {
        self.auth.borrow().cookies_file.clone()
    }

    pub fn snapshot(&self, raw: &str) -> Result<WatchSnapshot, EngineError> {
        let handle = self.known_handle(raw)?;
        self.scheduler
            .snapshot(&handle)
            .ok_or(EngineError::UnknownUser(handle))
    }

    pub fn snapshots(&self) -> Vec<WatchSnapshot> {
        self.scheduler.snapshots()
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<RecordHistoryEntry>, EngineError> {
        Ok(store::load_history(self.store.as_ref(), limit).await?)
    }

    pub async fn stats(&self) -> Result<RecordingStats, EngineError> {
        let history = store::load_history(self.store.as_ref(), usize::MAX).await?;
        let snapshots = self.snapshots();
        let mut stats = RecordingStats {
            total_recordings: history.len(),
            watched_users: snapshots.len(),
            active_recordings: snapshots
                .iter()
                .filter(|s| s.phase == Phase::Recording)
                .count(),
            ..RecordingStats::default()
        };
        for entry in &history {
            match entry.outcome {
                RecordOutcome::Completed => stats.completed += 1,
                RecordOutcome::Interrupted => stats.interrupted += 1,
                RecordOutcome::Failed => stats.failed += 1,
            }
            stats.total_bytes += entry.size_bytes;
            stats.total_seconds += entry.duration_seconds;
        }
        Ok(stats)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 停止所有 watcher 并等待录像收尾，超时后放弃等待
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down engine ({} users)", self.scheduler.len());
        let drain = async {
            self.scheduler.shutdown().await;
            self.finalizers.close();
            self.finalizers.wait().await;
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("Engine shutdown timed out after {:?}", timeout);
        } else {
            info!("Engine stopped.");
        }
    }

    fn known_handle(&self, raw: &str) -> Result<String, EngineError> {
        normalize_handle(raw).ok_or_else(|| EngineError::InvalidHandle(raw.to_string()))
    }
}
