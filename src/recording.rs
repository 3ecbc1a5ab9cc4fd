use crate::error::EngineError;
use crate::model::{Quality, RecordHistoryEntry, RecordOutcome, ResolvedStream, SessionMetrics};
use crate::process::{SupervisedChild, Termination};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 小于该大小的录像不做 MP4 转封装
const REMUX_MIN_BYTES: u64 = 50 * 1024;

/// 录制进程的构建方式
pub trait RecorderLauncher: Send + Sync {
    fn program(&self) -> &str;
    fn command(&self, stream: &ResolvedStream, destination: &Path) -> Command;
}

pub struct FfmpegRecorder {
    binary: String,
}

impl FfmpegRecorder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl RecorderLauncher for FfmpegRecorder {
    fn program(&self) -> &str {
        &self.binary
    }

    fn command(&self, stream: &ResolvedStream, destination: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-y");
        cmd.arg("-loglevel").arg("warning");
        // 直播源断线自动重连
        cmd.arg("-reconnect").arg("1");
        cmd.arg("-reconnect_streamed").arg("1");
        cmd.arg("-reconnect_delay_max").arg("5");
        cmd.arg("-i").arg(&stream.url);
        cmd.args(codec_args(stream.quality));
        // FLV 对未正常结束的写入更宽容
        cmd.arg("-f").arg("flv").arg(destination);

        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd
    }
}

fn codec_args(quality: Quality) -> &'static [&'static str] {
    match quality {
        Quality::Best | Quality::High => &["-c", "copy"],
        Quality::Medium => &[
            "-c:v", "libx264", "-preset", "veryfast", "-vf", "scale=-2:720", "-c:a", "copy",
        ],
        Quality::Low => &[
            "-c:v", "libx264", "-preset", "veryfast", "-vf", "scale=-2:480", "-c:a", "copy",
        ],
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// 优雅停止的等待时间
    pub stop_timeout: Duration,
    /// 文件大小与进程存活的轮询间隔
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub success: bool,
    pub code: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 进程在超时前退出，输出文件已封装完成
    Finalized,
    /// 超时后被强制结束
    Interrupted,
    AlreadyStopping,
}

/// 一次录制：一个受监管的录制进程 + 输出文件
pub struct RecordingSession {
    handle: String,
    stream: ResolvedStream,
    destination: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    bytes_written: Arc<AtomicU64>,
    child: Arc<Mutex<SupervisedChild>>,
    stopping: AtomicBool,
    stop_timeout: Duration,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    monitor: JoinHandle<()>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl RecordingSession {
    /// 启动录制进程
    ///
    /// # 错误处理
    /// - 系统可用内存不足时返回错误
    /// - 录制进程启动失败时返回错误
    pub fn start(
        handle: &str,
        stream: ResolvedStream,
        destination: PathBuf,
        launcher: &dyn RecorderLauncher,
        options: SessionOptions,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self, EngineError> {
        // 1. 检查系统内存是否足够
        check_memory()?;

        info!("Starting recording [{}]. Output: {:?}", handle, destination);

        // 2. 启动录制子进程
        let cmd = launcher.command(&stream, &destination);
        let child = SupervisedChild::spawn(cmd, launcher.program()).map_err(|e| {
            error!("Failed to spawn recorder for [{}]: {}", handle, e);
            e
        })?;
        let child = Arc::new(Mutex::new(child));

        // 3. 启动监控任务：轮询文件大小与进程存活
        let bytes_written = Arc::new(AtomicU64::new(0));
        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor = tokio::spawn(monitor_process(
            handle.to_string(),
            child.clone(),
            destination.clone(),
            bytes_written.clone(),
            exit_tx,
            options.poll_interval,
        ));

        Ok(Self {
            handle: handle.to_string(),
            stream,
            destination,
            started_at: Utc::now(),
            started: Instant::now(),
            bytes_written,
            child,
            stopping: AtomicBool::new(false),
            stop_timeout: options.stop_timeout,
            exit_rx,
            monitor,
            _permit: permit,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn stream(&self) -> &ResolvedStream {
        &self.stream
    }

    pub fn metrics_snapshot(&self) -> SessionMetrics {
        SessionMetrics {
            elapsed_secs: self.started.elapsed().as_secs(),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// 录制进程退出 (自行退出或被停止) 后返回
    pub async fn exited(&self) -> ExitReport {
        let mut rx = self.exit_rx.clone();
        let lost = ExitReport {
            success: false,
            code: None,
        };
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => (*report).unwrap_or(lost),
            Err(_) => lost,
        };
        report
    }

    /// 重新读取输出文件大小后返回已写入字节数
    pub async fn refresh_bytes(&self) -> u64 {
        refresh_size(&self.destination, &self.bytes_written).await;
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// 停止录制。graceful 时先发送中断信号等待封装完成，超时后强制结束。
    /// 重复调用返回 `AlreadyStopping`。
    pub async fn stop(&self, graceful: bool) -> StopOutcome {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return StopOutcome::AlreadyStopping;
        }
        info!("Stopping recording [{}] (graceful: {})", self.handle, graceful);

        let termination = {
            let mut child = self.child.lock().await;
            if graceful {
                child.terminate(self.stop_timeout).await
            } else {
                child.kill().await;
                Termination::Forced
            }
        };
        refresh_size(&self.destination, &self.bytes_written).await;

        if termination.was_forced() {
            warn!("Recording [{}] was force-killed", self.handle);
            StopOutcome::Interrupted
        } else {
            StopOutcome::Finalized
        }
    }

    /// 结束会话并生成历史记录；零字节输出记为 Failed
    pub async fn finish(self, outcome: RecordOutcome, remux_with: Option<&str>) -> RecordHistoryEntry {
        self.monitor.abort();
        drop(self._permit);
        refresh_size(&self.destination, &self.bytes_written).await;

        let elapsed = self.started.elapsed().as_secs();
        let mut size = self.bytes_written.load(Ordering::Relaxed);
        let mut path = self.destination.clone();
        let outcome = if size == 0 {
            let _ = tokio::fs::remove_file(&self.destination).await;
            RecordOutcome::Failed
        } else {
            outcome
        };

        if let Some(ffmpeg) = remux_with.filter(|_| size >= REMUX_MIN_BYTES) {
            match remux_to_mp4(ffmpeg, &self.destination).await {
                Ok(mp4) => {
                    if let Ok(meta) = tokio::fs::metadata(&mp4).await {
                        size = meta.len();
                    }
                    path = mp4;
                }
                Err(e) => warn!("Remux failed for [{}], keeping FLV: {:#}", self.handle, e),
            }
        }

        info!(
            "Recording [{}] finished: {:?}, {}s, {} bytes",
            self.handle, outcome, elapsed, size
        );
        RecordHistoryEntry {
            handle: self.handle,
            title: self.stream.title,
            file_path: path,
            started_at: self.started_at,
            duration_seconds: elapsed,
            size_bytes: size,
            outcome,
        }
    }
}

async fn monitor_process(
    handle: String,
    child: Arc<Mutex<SupervisedChild>>,
    destination: PathBuf,
    bytes_written: Arc<AtomicU64>,
    exit_tx: watch::Sender<Option<ExitReport>>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        refresh_size(&destination, &bytes_written).await;

        let status = child.lock().await.try_wait();
        match status {
            Ok(Some(status)) => {
                if status.success() {
                    info!("Recorder [{}] exited with: {}", handle, status);
                } else {
                    warn!("Recorder [{}] exited unexpectedly with: {}", handle, status);
                }
                refresh_size(&destination, &bytes_written).await;
                exit_tx.send_replace(Some(status.into()));
                return;
            }
            Ok(None) => {}
            Err(e) => error!("Process monitor error [{}]: {}", handle, e),
        }
    }
}

/// 计数器单调递增
async fn refresh_size(path: &Path, counter: &AtomicU64) {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        counter.fetch_max(meta.len(), Ordering::Relaxed);
    }
}

fn check_memory() -> Result<(), EngineError> {
    match sys_info::mem_info() {
        Ok(mem) => {
            // 可用内存小于 5MB 时拒绝启动
            if mem.avail < 5120 {
                return Err(EngineError::LowMemory(mem.avail));
            }
        }
        Err(e) => {
            // 无法获取内存信息时仅记录警告
            warn!("Failed to check memory usage: {}", e);
        }
    }
    Ok(())
}

/// 替换文件名模板中的占位符并去掉非法字符
pub fn render_filename(pattern: &str, handle: &str, now: DateTime<Local>) -> String {
    let name = pattern
        .replace("{handle}", handle)
        .replace("{username}", handle)
        .replace("{date}", &now.format("%Y%m%d").to_string())
        .replace("{time}", &now.format("%H%M%S").to_string())
        .replace("{datetime}", &now.format("%Y%m%d_%H%M%S").to_string());
    let name: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();
    if name.trim().is_empty() {
        handle.to_string()
    } else {
        name
    }
}

/// 预留一个唯一的输出路径 (create_new 原子创建，避免不同会话冲突)
pub async fn reserve_destination(
    dir: &Path,
    pattern: &str,
    handle: &str,
    now: DateTime<Local>,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let stem = format!(
        "{}_{:03}",
        render_filename(pattern, handle, now),
        now.timestamp_subsec_millis() % 1000
    );

    for counter in 0..1000u32 {
        let name = if counter == 0 {
            format!("{}.flv", stem)
        } else {
            format!("{}_{:03}.flv", stem, counter)
        };
        let path = dir.join(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", stem),
    ))
}

/// FLV 转封装为 MP4，成功后删除原文件
pub async fn remux_to_mp4(ffmpeg: &str, input: &Path) -> anyhow::Result<PathBuf> {
    let output = input.with_extension("mp4");
    let status = Command::new(ffmpeg)
        .arg("-hide_banner")
        .arg("-y")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(input)
        .arg("-c")
        .arg("copy")
        .arg("-movflags")
        .arg("+faststart")
        .arg(&output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await?;

    if !status.success() {
        let _ = tokio::fs::remove_file(&output).await;
        anyhow::bail!("ffmpeg remux exited with {}", status);
    }
    if let Err(e) = tokio::fs::remove_file(input).await {
        warn!("Failed to remove {:?} after remux: {}", input, e);
    }
    Ok(output)
}
