use crate::bus::{EngineEvent, EventBus};
use crate::config::{AppConfig, RetryPolicy};
use crate::error::EngineError;
use crate::machine::{CheckTrigger, Effect, WatchMachine};
use crate::model::{ErrorKind, MonitoredUser, Phase, RecordOutcome, ResolvedStream, WatchSnapshot};
use crate::preview::{PreviewFeed, PreviewOptions};
use crate::recording::{
    reserve_destination, ExitReport, RecorderLauncher, RecordingSession, SessionOptions,
    StopOutcome,
};
use crate::resolver::{AuthContext, Resolver};
use crate::scheduler::{clamp_poll_interval, MAX_POLL_INTERVAL};
use crate::store::{self, Store};
use bytes::Bytes;
use chrono::Local;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// 控制端发给 watcher 的命令，结果通过 oneshot 返回
pub enum Command {
    CheckNow(Reply<()>),
    StartRecording(Reply<PathBuf>),
    StopRecording(Reply<RecordOutcome>),
    AttachPreview(Reply<watch::Receiver<Option<Bytes>>>),
    DetachPreview(Reply<()>),
    PreviewFrame(Reply<Option<Bytes>>),
    /// 暂停或恢复定时轮询，返回更新后的账号配置
    SetEnabled(bool, Reply<MonitoredUser>),
}

/// 所有 watcher 共用的运行参数
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub jitter: f64,
    pub auto_record: bool,
    pub auto_resume: bool,
    pub resume_grace: Duration,
    pub metrics_interval: Duration,
    pub session: SessionOptions,
    pub max_concurrent: usize,
    pub retry: RetryPolicy,
    pub output_dir: PathBuf,
    pub filename_pattern: String,
    /// 转封装使用的 ffmpeg，None 表示保留 FLV
    pub remux_with: Option<String>,
    pub preview: PreviewOptions,
}

impl WatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let watch = &config.watch;
        let server = &config.server;
        Self {
            jitter: watch.jitter,
            auto_record: watch.auto_record,
            auto_resume: watch.auto_resume,
            resume_grace: Duration::from_secs(watch.resume_grace_secs),
            metrics_interval: Duration::from_millis(watch.metrics_interval_ms.max(50)),
            session: SessionOptions {
                stop_timeout: Duration::from_secs(watch.stop_timeout_secs),
                poll_interval: Duration::from_secs(1),
            },
            max_concurrent: watch.max_concurrent_recordings,
            retry: config.retry.clone(),
            output_dir: server.output_dir.clone(),
            filename_pattern: server.filename_pattern.clone(),
            remux_with: server
                .remux_to_mp4
                .then(|| server.ffmpeg_binary.clone()),
            preview: PreviewOptions::new(server.ffmpeg_binary.clone()),
        }
    }
}

/// 所有 watcher 共享的协作者
pub struct WatchContext {
    pub resolver: Arc<dyn Resolver>,
    pub launcher: Arc<dyn RecorderLauncher>,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub auth: watch::Receiver<AuthContext>,
    pub poll_interval: watch::Receiver<Duration>,
    pub settings: WatchSettings,
    /// 同时录制数上限
    pub recording_slots: Arc<Semaphore>,
    /// 录制结束后的收尾任务 (转封装、写历史)
    pub finalizers: TaskTracker,
}

/// 调度器持有的 watcher 句柄
pub struct WatcherHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<WatchSnapshot>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn snapshot(&self) -> WatchSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchSnapshot> {
        self.snapshot.clone()
    }

    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// 取消任务，并等待它释放录制和预览
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Watcher task ended abnormally: {}", e);
        }
    }
}

/// 发送一条命令并等待 watcher 回复
pub async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T, EngineError> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(make(tx))
        .await
        .map_err(|_| EngineError::ShuttingDown)?;
    rx.await.map_err(|_| EngineError::ShuttingDown)?
}

/// 为账号启动独立的 watcher 任务
///
/// 任务独占该账号的状态机、录制会话和预览。定时器、解析结果、录制进程退出
/// 和控制命令都在这个任务上处理，同一账号的状态转移严格有序，不同账号之间完全并行。
pub fn spawn_watcher(
    user: MonitoredUser,
    ctx: Arc<WatchContext>,
    cancel: CancellationToken,
) -> WatcherHandle {
    let (commands, rx) = mpsc::channel(16);
    let (snapshot_tx, snapshot) = watch::channel(WatchSnapshot::idle(&user));
    let watcher = Watcher {
        machine: WatchMachine::new(user, ctx.settings.retry.clone()),
        poll_interval: ctx.poll_interval.clone(),
        ctx,
        snapshot_tx,
        stream: None,
        session: None,
        preview: None,
        resolving: None,
        next_wake: None,
        resume_deadline: None,
    };
    let task = tokio::spawn(watcher.run(rx, cancel.clone()));
    WatcherHandle {
        commands,
        snapshot,
        cancel,
        task,
    }
}

enum Wake {
    Shutdown,
    Command(Command),
    Resolved(Result<ResolvedStream, ErrorKind>),
    RecorderExited(ExitReport),
    Timer,
    IntervalChanged,
    Metrics,
}

struct Watcher {
    ctx: Arc<WatchContext>,
    machine: WatchMachine,
    snapshot_tx: watch::Sender<WatchSnapshot>,
    poll_interval: watch::Receiver<Duration>,
    /// 最近一次解析结果，仅在 Live 时持有；开始录制时被会话取走
    stream: Option<ResolvedStream>,
    session: Option<RecordingSession>,
    preview: Option<PreviewFeed>,
    resolving: Option<JoinHandle<Result<ResolvedStream, ErrorKind>>>,
    next_wake: Option<(Instant, CheckTrigger)>,
    /// 录制进程意外退出后，在此之前重新解析成功则自动续录
    resume_deadline: Option<Instant>,
}

impl Watcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        info!("Watching @{}", self.handle());
        self.announce();
        self.schedule_first_check();

        let mut metrics = tokio::time::interval(self.ctx.settings.metrics_interval);
        metrics.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut interval_open = true;

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Shutdown,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => Wake::Command(cmd),
                    None => Wake::Shutdown,
                },
                outcome = resolved(&mut self.resolving) => Wake::Resolved(outcome),
                report = recorder_exit(self.session.as_ref()) => Wake::RecorderExited(report),
                _ = sleep_until(self.next_wake.map(|(at, _)| at)) => Wake::Timer,
                changed = self.poll_interval.changed(), if interval_open => match changed {
                    Ok(()) => Wake::IntervalChanged,
                    Err(_) => {
                        interval_open = false;
                        continue;
                    }
                },
                _ = metrics.tick(), if self.session.is_some() => Wake::Metrics,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Command(cmd) => self.handle_command(cmd).await,
                Wake::Resolved(outcome) => self.on_resolved(outcome).await,
                Wake::RecorderExited(report) => self.on_recorder_exit(report).await,
                Wake::Timer => self.on_timer(),
                Wake::IntervalChanged => {
                    if matches!(self.next_wake, Some((_, CheckTrigger::Timer))) {
                        self.schedule_poll();
                    }
                }
                Wake::Metrics => self.publish_metrics(),
            }
        }

        self.teardown().await;
    }

    fn handle(&self) -> &str {
        self.machine.handle()
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::CheckNow(reply) => {
                let _ = reply.send(self.check(CheckTrigger::Manual));
            }
            Command::StartRecording(reply) => {
                let _ = reply.send(self.start_recording().await);
            }
            Command::StopRecording(reply) => {
                let _ = reply.send(self.stop_recording().await);
            }
            Command::AttachPreview(reply) => {
                let _ = reply.send(self.attach_preview().await);
            }
            Command::DetachPreview(reply) => {
                let _ = reply.send(self.detach_preview().await);
            }
            Command::PreviewFrame(reply) => {
                let frame = self
                    .preview
                    .as_ref()
                    .map(PreviewFeed::latest_frame)
                    .ok_or_else(|| EngineError::NotAttached(self.handle().to_string()));
                let _ = reply.send(frame);
            }
            Command::SetEnabled(enabled, reply) => {
                let _ = reply.send(Ok(self.set_enabled(enabled)));
            }
        }
    }

    fn set_enabled(&mut self, enabled: bool) -> MonitoredUser {
        if self.machine.set_enabled(enabled) {
            if enabled {
                info!("@{}: polling resumed", self.handle());
                self.schedule_first_check();
            } else {
                info!("@{}: polling paused", self.handle());
                self.next_wake = None;
                self.resume_deadline = None;
            }
            self.publish_state();
        }
        self.machine.state().user.clone()
    }

    fn on_timer(&mut self) {
        let Some((_, trigger)) = self.next_wake.take() else {
            return;
        };
        self.expire_resume();
        match self.check(trigger) {
            Ok(()) if self.machine.phase() == Phase::Checking => {}
            _ => self.schedule_poll(),
        }
    }

    /// 状态机接受该触发时发起解析，否则什么也不做
    fn check(&mut self, trigger: CheckTrigger) -> Result<(), EngineError> {
        if self.resolving.is_some() {
            return Ok(());
        }
        if !self.machine.begin_check(trigger)? {
            debug!(
                "@{}: {:?} check skipped while {}",
                self.handle(),
                trigger,
                self.machine.phase()
            );
            return Ok(());
        }

        let ctx = self.ctx.clone();
        let user = self.machine.state().user.clone();
        let auth = ctx.auth.borrow().clone();
        self.resolving = Some(tokio::spawn(async move {
            ctx.resolver.resolve(&user.handle, user.quality, &auth).await
        }));
        self.publish_state();
        Ok(())
    }

    async fn on_resolved(&mut self, outcome: Result<ResolvedStream, ErrorKind>) {
        match &outcome {
            Ok(stream) => info!("@{} is live: {} ({} viewers)", self.handle(), stream.title, stream.viewers),
            Err(ErrorKind::NotLive) => debug!("@{} is offline", self.handle()),
            Err(kind) => warn!("Check failed for @{}: {}", self.handle(), kind),
        }

        let handle = self.handle().to_string();
        let mut retry_in = None;
        for effect in self.machine.on_resolved(outcome) {
            match effect {
                Effect::LiveDetected(stream) => {
                    self.ctx.bus.publish(EngineEvent::LiveDetected {
                        handle: handle.clone(),
                        title: stream.title.clone(),
                        viewers: stream.viewers,
                    });
                    self.stream = Some(stream);
                }
                Effect::NeedsCookies => {
                    warn!("@{} requires cookies to resolve", handle);
                    self.ctx.bus.publish(EngineEvent::NeedsCookies {
                        handle: handle.clone(),
                    });
                }
                Effect::ScheduleRetry(delay) => {
                    info!("@{}: retrying in {}s", handle, delay.as_secs());
                    retry_in = Some(delay);
                }
                Effect::Surface {
                    kind,
                    failures,
                    gave_up,
                } => {
                    let message = if gave_up {
                        format!("{} ({} consecutive failures), waiting for next poll", kind, failures)
                    } else {
                        kind.to_string()
                    };
                    self.ctx.bus.publish(EngineEvent::Warning {
                        handle: handle.clone(),
                        kind,
                        failures,
                        message,
                    });
                }
            }
        }

        match self.machine.phase() {
            Phase::Live => {}
            Phase::Offline => {
                self.stream = None;
                self.resume_deadline = None;
                if let Some(feed) = self.preview.take() {
                    feed.detach().await;
                }
            }
            _ => self.stream = None,
        }
        self.publish_state();

        match retry_in {
            Some(delay) if self.machine.state().user.enabled => {
                self.next_wake = Some((wake_at(delay), CheckTrigger::Retry))
            }
            _ => self.schedule_poll(),
        }

        if self.machine.phase() == Phase::Live {
            let resuming = self
                .resume_deadline
                .take()
                .is_some_and(|deadline| Instant::now() <= deadline);
            if resuming || self.ctx.settings.auto_record {
                if let Err(e) = self.start_recording().await {
                    warn!("Automatic recording for @{} not started: {}", handle, e);
                }
            }
        }
    }

    async fn start_recording(&mut self) -> Result<PathBuf, EngineError> {
        self.machine.require(Phase::Live, "start recording")?;
        let handle = self.handle().to_string();
        let stream = self
            .stream
            .clone()
            .ok_or_else(|| EngineError::NoResolvedStream(handle.clone()))?;
        let permit = self
            .ctx
            .recording_slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::ConcurrencyLimit(self.ctx.settings.max_concurrent))?;

        let settings = &self.ctx.settings;
        let destination = reserve_destination(
            &settings.output_dir,
            &settings.filename_pattern,
            &handle,
            Local::now(),
        )
        .await?;
        let session = match RecordingSession::start(
            &handle,
            stream,
            destination.clone(),
            self.ctx.launcher.as_ref(),
            settings.session,
            Some(permit),
        ) {
            Ok(session) => session,
            Err(e) => {
                let _ = tokio::fs::remove_file(&destination).await;
                return Err(e);
            }
        };

        self.machine.begin_recording()?;
        // 每个会话使用新解析的地址，不复用
        self.stream = None;
        self.session = Some(session);
        self.ctx.bus.publish(EngineEvent::RecordingStarted {
            handle,
            path: destination.clone(),
        });
        self.publish_state();
        Ok(destination)
    }

    async fn stop_recording(&mut self) -> Result<RecordOutcome, EngineError> {
        self.machine.require(Phase::Recording, "stop recording")?;
        let Some(session) = self.session.take() else {
            return Err(EngineError::InvalidState {
                handle: self.handle().to_string(),
                phase: self.machine.phase(),
                action: "stop recording",
            });
        };

        let outcome = match session.stop(true).await {
            StopOutcome::Interrupted => RecordOutcome::Interrupted,
            StopOutcome::Finalized | StopOutcome::AlreadyStopping => RecordOutcome::Completed,
        };
        self.machine.finish_recording(outcome, true);
        self.finalize(session, outcome);
        self.publish_state();
        Ok(outcome)
    }

    async fn on_recorder_exit(&mut self, report: ExitReport) {
        let Some(session) = self.session.take() else {
            return;
        };
        // 退出码为 0 但没有写出任何数据，同样按进程失败处理
        let empty = session.refresh_bytes().await == 0;
        let outcome = if report.success && !empty {
            RecordOutcome::Completed
        } else {
            RecordOutcome::Interrupted
        };
        self.machine.finish_recording(outcome, false);
        self.finalize(session, outcome);

        if self.machine.phase() == Phase::Error {
            let handle = self.handle().to_string();
            let message = if empty {
                format!("recorder produced no output (exit code {:?})", report.code)
            } else {
                format!("recorder exited with code {:?}", report.code)
            };
            self.ctx.bus.publish(EngineEvent::Warning {
                handle: handle.clone(),
                kind: ErrorKind::ProcessFailure,
                failures: self.machine.state().consecutive_failures,
                message,
            });
            if self.ctx.settings.auto_resume && self.machine.state().user.enabled {
                info!("@{}: recorder died, re-resolving to resume", handle);
                self.resume_deadline = Some(wake_at(self.ctx.settings.resume_grace));
                self.next_wake = Some((Instant::now(), CheckTrigger::Resume));
            }
        }
        self.publish_state();
    }

    /// 续录窗口已过则放弃续录
    fn expire_resume(&mut self) {
        let Some(deadline) = self.resume_deadline else {
            return;
        };
        if Instant::now() <= deadline {
            return;
        }
        self.resume_deadline = None;
        let retryable = self
            .machine
            .state()
            .last_error
            .is_some_and(|k| k.is_transient() || k == ErrorKind::ProcessFailure);
        if self.machine.phase() == Phase::Error && retryable {
            info!("@{}: resume window expired", self.handle());
            self.machine.give_up();
            self.publish_state();
        }
    }

    /// 收尾在后台进行：转封装可能较慢，不能阻塞状态机
    fn finalize(&self, session: RecordingSession, outcome: RecordOutcome) {
        let ctx = self.ctx.clone();
        self.ctx.finalizers.spawn(async move {
            let remux_with = ctx.settings.remux_with.clone();
            let entry = session.finish(outcome, remux_with.as_deref()).await;
            if let Err(e) = store::append_history(ctx.store.as_ref(), &entry).await {
                error!("Failed to persist history for @{}: {:#}", entry.handle, e);
            }
            ctx.bus.publish(EngineEvent::RecordingFinished { entry });
        });
    }

    async fn attach_preview(&mut self) -> Result<watch::Receiver<Option<Bytes>>, EngineError> {
        let handle = self.handle().to_string();
        if self.preview.as_ref().is_some_and(PreviewFeed::is_active) {
            return Err(EngineError::AlreadyAttached(handle));
        }
        let stream = match self.machine.phase() {
            Phase::Recording => self.session.as_ref().map(|s| s.stream().clone()),
            Phase::Live => self.stream.clone(),
            _ => None,
        }
        .ok_or_else(|| EngineError::NoResolvedStream(handle.clone()))?;

        // 已经结束的预览直接替换
        if let Some(stale) = self.preview.take() {
            stale.detach().await;
        }
        let feed = PreviewFeed::attach(&handle, &stream, &self.ctx.settings.preview)?;
        let frames = feed.frames();
        self.preview = Some(feed);
        self.publish_state();
        Ok(frames)
    }

    async fn detach_preview(&mut self) -> Result<(), EngineError> {
        let feed = self
            .preview
            .take()
            .ok_or_else(|| EngineError::NotAttached(self.handle().to_string()))?;
        feed.detach().await;
        self.publish_state();
        Ok(())
    }

    fn schedule_first_check(&mut self) {
        if !self.machine.state().user.enabled {
            return;
        }
        // 首次检查在 [0, jitter * interval] 内随机错开
        let base = clamp_poll_interval(*self.poll_interval.borrow());
        let jitter = self.ctx.settings.jitter.clamp(0.0, 1.0);
        let delay = if jitter == 0.0 {
            Duration::ZERO
        } else {
            base.mul_f64(rand::thread_rng().gen_range(0.0..=jitter))
        };
        self.next_wake = Some((wake_at(delay), CheckTrigger::Timer));
    }

    fn schedule_poll(&mut self) {
        if !self.machine.state().user.enabled {
            self.next_wake = None;
            return;
        }
        let base = clamp_poll_interval(*self.poll_interval.borrow());
        let delay = jittered(base, self.ctx.settings.jitter);
        self.next_wake = Some((wake_at(delay), CheckTrigger::Timer));
    }

    fn snapshot(&self) -> WatchSnapshot {
        let state = self.machine.state();
        let title = match &self.session {
            Some(session) => Some(session.stream().title.clone()),
            None => self.stream.as_ref().map(|s| s.title.clone()),
        };
        WatchSnapshot {
            handle: state.user.handle.clone(),
            quality: state.user.quality,
            enabled: state.user.enabled,
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            last_checked_at: state.last_checked_at,
            last_error: state.last_error,
            title,
            metrics: self.session.as_ref().map(RecordingSession::metrics_snapshot),
            recording_path: self.session.as_ref().map(|s| s.destination().to_path_buf()),
            preview_attached: self.preview.is_some(),
        }
    }

    fn announce(&self) {
        self.ctx.bus.publish(EngineEvent::PhaseChanged {
            snapshot: self.snapshot_tx.borrow().clone(),
        });
    }

    /// 除录制指标外有任何变化时才发布快照
    fn publish_state(&self) {
        let next = self.snapshot();
        let changed = self.snapshot_tx.send_if_modified(|current| {
            let differs = WatchSnapshot {
                metrics: current.metrics,
                ..next.clone()
            } != *current;
            *current = next.clone();
            differs
        });
        if changed {
            debug!("@{} -> {}", next.handle, next.phase);
            self.ctx
                .bus
                .publish(EngineEvent::PhaseChanged { snapshot: next });
        }
    }

    fn publish_metrics(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let metrics = session.metrics_snapshot();
        self.snapshot_tx
            .send_modify(|snapshot| snapshot.metrics = Some(metrics));
        self.ctx.bus.publish(EngineEvent::MetricsTick {
            handle: self.handle().to_string(),
            metrics,
        });
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.resolving.take() {
            task.abort();
        }
        if let Some(feed) = self.preview.take() {
            feed.detach().await;
        }
        if let Some(session) = self.session.take() {
            let outcome = match session.stop(true).await {
                StopOutcome::Interrupted => RecordOutcome::Interrupted,
                _ => RecordOutcome::Completed,
            };
            self.machine.finish_recording(outcome, true);
            self.finalize(session, outcome);
            self.publish_state();
        }
        info!("Stopped watching @{}", self.handle());
    }
}

/// 计算唤醒时刻；延迟超过两倍轮询上限时截断，避免 Instant 溢出
fn wake_at(delay: Duration) -> Instant {
    let delay = delay.min(MAX_POLL_INTERVAL * 2);
    let now = Instant::now();
    now.checked_add(delay).unwrap_or(now)
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    base.mul_f64(factor)
}

async fn resolved(
    task: &mut Option<JoinHandle<Result<ResolvedStream, ErrorKind>>>,
) -> Result<ResolvedStream, ErrorKind> {
    let joined = match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    };
    *task = None;
    joined.unwrap_or_else(|e| {
        error!("Resolver task failed: {}", e);
        Err(ErrorKind::Unknown)
    })
}

async fn recorder_exit(session: Option<&RecordingSession>) -> ExitReport {
    match session {
        Some(session) => session.exited().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::Subscription;
    use crate::model::Quality;
    use crate::recording::tests::{stream, ScriptRecorder};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 依次返回预设结果，用完后一直返回 `fallback`
    pub(crate) struct ScriptedResolver {
        outcomes: Mutex<VecDeque<Result<ResolvedStream, ErrorKind>>>,
        fallback: Result<ResolvedStream, ErrorKind>,
        calls: Mutex<u32>,
    }

    impl ScriptedResolver {
        pub(crate) fn new(
            outcomes: Vec<Result<ResolvedStream, ErrorKind>>,
            fallback: Result<ResolvedStream, ErrorKind>,
        ) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                fallback,
                calls: Mutex::new(0),
            }
        }

        pub(crate) fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Resolver for ScriptedResolver {
        async fn resolve(
            &self,
            _handle: &str,
            _quality: Quality,
            _auth: &AuthContext,
        ) -> Result<ResolvedStream, ErrorKind> {
            *self.calls.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    pub(crate) fn test_config(output_dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.output_dir = output_dir.to_path_buf();
        config.server.remux_to_mp4 = false;
        config.watch.jitter = 0.0;
        config.watch.auto_record = false;
        config.watch.auto_resume = false;
        config.watch.metrics_interval_ms = 50;
        config.watch.stop_timeout_secs = 3;
        config
    }

    struct Harness {
        ctx: Arc<WatchContext>,
        _poll_tx: watch::Sender<Duration>,
        _auth_tx: watch::Sender<AuthContext>,
    }

    fn harness(
        config: &AppConfig,
        poll: Duration,
        resolver: Arc<dyn Resolver>,
        recorder: &str,
    ) -> Harness {
        let (poll_tx, poll_interval) = watch::channel(poll);
        let (auth_tx, auth) = watch::channel(AuthContext::default());
        let mut settings = WatchSettings::from_config(config);
        settings.session.poll_interval = Duration::from_millis(50);
        let ctx = Arc::new(WatchContext {
            resolver,
            launcher: Arc::new(ScriptRecorder(recorder.to_string())),
            store: Arc::new(MemoryStore::new()),
            bus: EventBus::new(256),
            auth,
            poll_interval,
            recording_slots: Arc::new(Semaphore::new(settings.max_concurrent)),
            finalizers: TaskTracker::new(),
            settings,
        });
        Harness {
            ctx,
            _poll_tx: poll_tx,
            _auth_tx: auth_tx,
        }
    }

    async fn next_phase(sub: &mut Subscription) -> Phase {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("timed out waiting for event")
                .expect("bus closed");
            if let EngineEvent::PhaseChanged { snapshot } = event {
                return snapshot.phase;
            }
        }
    }

    async fn wait_for_phase(sub: &mut Subscription, phase: Phase) {
        while next_phase(sub).await != phase {}
    }

    #[tokio::test]
    async fn offline_handle_cycles_on_timer() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(vec![], Err(ErrorKind::NotLive)));
        let h = harness(&config, Duration::from_millis(30), resolver, "exit 0");
        let mut sub = h.ctx.bus.subscribe();

        let watcher = spawn_watcher(
            MonitoredUser::new("alice", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        let mut phases = Vec::new();
        for _ in 0..7 {
            phases.push(next_phase(&mut sub).await);
        }
        use Phase::*;
        assert_eq!(
            phases,
            vec![Idle, Checking, Offline, Checking, Offline, Checking, Offline]
        );
        watcher.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn manual_recording_completes_on_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Ok(stream("https://cdn/bob.flv"))],
            Err(ErrorKind::NotLive),
        ));
        let h = harness(
            &config,
            Duration::from_secs(3600),
            resolver,
            "printf '%s' \"$2\" > \"$1\"; sleep 0.3; exit 0",
        );
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("bob", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Live).await;

        let commands = watcher.commands();
        let path = request(&commands, Command::StartRecording).await.unwrap();
        assert_eq!(watcher.snapshot().phase, Phase::Recording);
        assert_eq!(watcher.snapshot().recording_path, Some(path.clone()));
        assert!(path.starts_with(dir.path()));

        // 第二次开始录制被拒绝
        let again = request(&commands, Command::StartRecording).await;
        assert!(matches!(again, Err(EngineError::InvalidState { .. })));

        wait_for_phase(&mut sub, Phase::Stopped).await;
        let entry = loop {
            match sub.recv().await {
                Some(EngineEvent::RecordingFinished { entry }) => break entry,
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        };
        assert_eq!(entry.outcome, RecordOutcome::Completed);
        assert_eq!(entry.file_path, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "https://cdn/bob.flv");

        let history = store::load_history(h.ctx.store.as_ref(), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].handle, "bob");
        watcher.stop().await;
    }

    #[tokio::test]
    async fn auth_failure_waits_for_manual_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Err(ErrorKind::AuthRequired)],
            Err(ErrorKind::NotLive),
        ));
        let h = harness(&config, Duration::from_millis(20), resolver.clone(), "exit 0");
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("carol", Quality::High),
            h.ctx.clone(),
            CancellationToken::new(),
        );

        wait_for_phase(&mut sub, Phase::Error).await;
        let snapshot = watcher.snapshot();
        assert_eq!(snapshot.last_error, Some(ErrorKind::AuthRequired));

        // 多个轮询周期内不会自动重试
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.calls(), 1);
        assert_eq!(watcher.snapshot().phase, Phase::Error);

        request(&watcher.commands(), Command::CheckNow).await.unwrap();
        wait_for_phase(&mut sub, Phase::Offline).await;
        assert!(resolver.calls() >= 2);
        watcher.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn removal_stops_active_recording_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watch.auto_record = true;
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Ok(stream("https://cdn/dan.flv"))],
            Err(ErrorKind::NotLive),
        ));
        let h = harness(
            &config,
            Duration::from_secs(3600),
            resolver,
            "trap 'exit 0' INT; printf 'x' > \"$1\"; while :; do sleep 0.05; done",
        );
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("dan", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Recording).await;
        assert_eq!(h.ctx.recording_slots.available_permits(), 3);

        // 等录制进程写出数据后再移除，否则会被当成空文件
        let mut snapshots = watcher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.metrics.is_some_and(|m| m.bytes_written > 0)),
        )
        .await
        .expect("recorder never wrote")
        .unwrap();
        watcher.stop().await;
        assert_eq!(snapshots.borrow().phase, Phase::Stopped);

        h.ctx.finalizers.close();
        h.ctx.finalizers.wait().await;
        assert_eq!(h.ctx.recording_slots.available_permits(), 4);
        let history = store::load_history(h.ctx.store.as_ref(), 10).await.unwrap();
        assert_eq!(history[0].outcome, RecordOutcome::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_recorder_resumes_with_fresh_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watch.auto_resume = true;
        config.watch.resume_grace_secs = 30;
        let resolver = Arc::new(ScriptedResolver::new(
            vec![
                Ok(stream("https://cdn/erin-1.flv")),
                Ok(stream("https://cdn/erin-2.flv")),
            ],
            Err(ErrorKind::NotLive),
        ));
        // 第一个地址模拟过期后崩溃，第二个持续录制
        let h = harness(
            &config,
            Duration::from_secs(3600),
            resolver.clone(),
            "printf 'x' > \"$1\"; case \"$2\" in *-1.flv) sleep 0.2; exit 1;; esac; \
             trap 'exit 0' INT; while :; do sleep 0.05; done",
        );
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("erin", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Live).await;
        request(&watcher.commands(), Command::StartRecording)
            .await
            .unwrap();

        wait_for_phase(&mut sub, Phase::Error).await;
        wait_for_phase(&mut sub, Phase::Recording).await;
        assert_eq!(resolver.calls(), 2);

        let mut snapshots = watcher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.metrics.is_some_and(|m| m.bytes_written > 0)),
        )
        .await
        .expect("resumed recorder never wrote")
        .unwrap();

        let outcome = request(&watcher.commands(), Command::StopRecording)
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Completed);
        watcher.stop().await;

        h.ctx.finalizers.close();
        h.ctx.finalizers.wait().await;
        let history = store::load_history(h.ctx.store.as_ref(), 10).await.unwrap();
        let mut outcomes: Vec<RecordOutcome> = history.iter().map(|e| e.outcome).collect();
        outcomes.sort_by_key(|o| *o != RecordOutcome::Interrupted);
        assert_eq!(
            outcomes,
            vec![RecordOutcome::Interrupted, RecordOutcome::Completed]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_counts_as_process_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Ok(stream("https://cdn/gus.flv"))],
            Err(ErrorKind::NotLive),
        ));
        // 正常退出但一个字节都没写
        let h = harness(&config, Duration::from_secs(3600), resolver, "sleep 0.1; exit 0");
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("gus", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Live).await;
        request(&watcher.commands(), Command::StartRecording)
            .await
            .unwrap();

        wait_for_phase(&mut sub, Phase::Error).await;
        let snapshot = watcher.snapshot();
        assert_eq!(snapshot.last_error, Some(ErrorKind::ProcessFailure));
        assert_eq!(snapshot.recording_path, None);
        watcher.stop().await;

        h.ctx.finalizers.close();
        h.ctx.finalizers.wait().await;
        let history = store::load_history(h.ctx.store.as_ref(), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, RecordOutcome::Failed);
        assert_eq!(h.ctx.recording_slots.available_permits(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn full_recording_slots_reject_new_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.watch.max_concurrent_recordings = 1;
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Ok(stream("https://cdn/hal.flv"))],
            Err(ErrorKind::NotLive),
        ));
        let h = harness(
            &config,
            Duration::from_secs(3600),
            resolver,
            "trap 'exit 0' INT; printf 'x' > \"$1\"; while :; do sleep 0.05; done",
        );
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("hal", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Live).await;

        // 唯一的名额被别的录制占用
        let held = h.ctx.recording_slots.clone().try_acquire_owned().unwrap();
        let commands = watcher.commands();
        let refused = request(&commands, Command::StartRecording).await;
        assert!(matches!(refused, Err(EngineError::ConcurrencyLimit(1))));
        assert_eq!(watcher.snapshot().phase, Phase::Live);
        assert_eq!(watcher.snapshot().recording_path, None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        drop(held);
        request(&commands, Command::StartRecording).await.unwrap();
        assert_eq!(watcher.snapshot().phase, Phase::Recording);
        assert_eq!(h.ctx.recording_slots.available_permits(), 0);
        watcher.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_preview_is_rejected_while_first_runs() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let decoder = dir.path().join("fake-ffmpeg");
        std::fs::write(&decoder, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755)).unwrap();

        let out = dir.path().join("out");
        let mut config = test_config(&out);
        config.server.ffmpeg_binary = decoder.to_string_lossy().into_owned();
        let resolver = Arc::new(ScriptedResolver::new(
            vec![Ok(stream("https://cdn/ivy.flv"))],
            Err(ErrorKind::NotLive),
        ));
        let h = harness(&config, Duration::from_secs(3600), resolver, "exit 0");
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("ivy", Quality::Best),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Live).await;

        let commands = watcher.commands();
        let frames = request(&commands, Command::AttachPreview).await.unwrap();
        assert!(frames.borrow().is_none());
        assert!(watcher.snapshot().preview_attached);

        let again = request(&commands, Command::AttachPreview).await;
        assert!(matches!(again, Err(EngineError::AlreadyAttached(_))));

        request(&commands, Command::DetachPreview).await.unwrap();
        assert!(!watcher.snapshot().preview_attached);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn paused_handle_is_not_polled() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(vec![], Err(ErrorKind::NotLive)));
        let h = harness(&config, Duration::from_millis(20), resolver.clone(), "exit 0");
        let mut sub = h.ctx.bus.subscribe();
        let mut user = MonitoredUser::new("jay", Quality::Best);
        user.enabled = false;
        let watcher = spawn_watcher(user, h.ctx.clone(), CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.calls(), 0);
        assert_eq!(watcher.snapshot().phase, Phase::Idle);
        assert!(!watcher.snapshot().enabled);

        // 暂停时手动检查仍然有效
        let commands = watcher.commands();
        request(&commands, Command::CheckNow).await.unwrap();
        wait_for_phase(&mut sub, Phase::Offline).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.calls(), 1);

        let user = request(&commands, |reply| Command::SetEnabled(true, reply))
            .await
            .unwrap();
        assert!(user.enabled);
        wait_for_phase(&mut sub, Phase::Checking).await;
        wait_for_phase(&mut sub, Phase::Checking).await;
        assert!(resolver.calls() >= 3);

        let user = request(&commands, |reply| Command::SetEnabled(false, reply))
            .await
            .unwrap();
        assert!(!user.enabled);
        // 已经发出的解析可能还会回来一次
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = resolver.calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(resolver.calls(), settled);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn preview_requires_a_resolved_stream() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let resolver = Arc::new(ScriptedResolver::new(vec![], Err(ErrorKind::NotLive)));
        let h = harness(&config, Duration::from_secs(3600), resolver, "exit 0");
        let mut sub = h.ctx.bus.subscribe();
        let watcher = spawn_watcher(
            MonitoredUser::new("finn", Quality::Low),
            h.ctx.clone(),
            CancellationToken::new(),
        );
        wait_for_phase(&mut sub, Phase::Offline).await;

        let commands = watcher.commands();
        let attach = request(&commands, Command::AttachPreview).await;
        assert!(matches!(attach, Err(EngineError::NoResolvedStream(_))));
        let detach = request(&commands, Command::DetachPreview).await;
        assert!(matches!(detach, Err(EngineError::NotAttached(_))));
        let frame = request(&commands, Command::PreviewFrame).await;
        assert!(matches!(frame, Err(EngineError::NotAttached(_))));
        watcher.stop().await;
    }

    #[test]
    fn wake_time_is_capped() {
        let now = Instant::now();
        let at = wake_at(Duration::MAX);
        assert!(at >= now);
        assert!(at <= Instant::now() + MAX_POLL_INTERVAL * 2);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(60);
        assert_eq!(jittered(base, 0.0), base);
        for _ in 0..100 {
            let d = jittered(base, 0.2);
            assert!(d >= Duration::from_secs(48) && d <= Duration::from_secs(72));
        }
    }
}
