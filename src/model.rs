use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 录制画质偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    Best,
    High,
    Medium,
    Low,
}

impl Quality {
    /// 按优先级排列的格式关键字，解析器依次匹配 format id
    pub fn preferences(self) -> &'static [&'static str] {
        match self {
            Quality::Best => &["origin", "uhd", "hd", "sd"],
            Quality::High => &["hd", "sd"],
            Quality::Medium => &["sd"],
            Quality::Low => &["sd", "ld"],
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Best => "best",
            Quality::High => "high",
            Quality::Medium => "medium",
            Quality::Low => "low",
        };
        f.write_str(s)
    }
}

/// 监控列表中的一个账号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredUser {
    pub handle: String,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl MonitoredUser {
    pub fn new(handle: impl Into<String>, quality: Quality) -> Self {
        Self {
            handle: handle.into(),
            quality,
            enabled: true,
        }
    }
}

/// 规范化账号：去空白、去掉开头的 `@`、转小写；为空时返回 None
pub fn normalize_handle(raw: &str) -> Option<String> {
    let handle = raw.trim().trim_start_matches('@').trim().to_lowercase();
    if handle.is_empty() || handle.contains(char::is_whitespace) || handle.contains('/') {
        return None;
    }
    Some(handle)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Checking,
    Live,
    Offline,
    Recording,
    Stopped,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Checking => "checking",
            Phase::Live => "live",
            Phase::Offline => "offline",
            Phase::Recording => "recording",
            Phase::Stopped => "stopped",
            Phase::Error => "error",
        };
        f.write_str(s)
    }
}

/// 解析与录制失败的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotLive,
    AuthRequired,
    RateLimited,
    NetworkError,
    Unknown,
    ProcessFailure,
}

impl ErrorKind {
    /// 可自动退避重试的错误
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::NetworkError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotLive => "not live",
            ErrorKind::AuthRequired => "authentication required",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::NetworkError => "network error",
            ErrorKind::Unknown => "unknown resolver failure",
            ErrorKind::ProcessFailure => "recorder process failure",
        };
        f.write_str(s)
    }
}

/// 单个账号的监控状态，只由该账号的 watcher 任务修改
#[derive(Debug, Clone, Serialize)]
pub struct WatchState {
    pub user: MonitoredUser,
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
}

impl WatchState {
    pub fn new(user: MonitoredUser) -> Self {
        Self {
            user,
            phase: Phase::Idle,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
        }
    }
}

/// 一次解析得到的可播放地址，每个录制会话必须重新解析
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedStream {
    pub url: String,
    pub expires_hint: Option<Duration>,
    pub quality: Quality,
    pub title: String,
    pub viewers: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetrics {
    pub elapsed_secs: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// 录制历史记录，只追加不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHistoryEntry {
    pub handle: String,
    pub title: String,
    pub file_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub size_bytes: u64,
    pub outcome: RecordOutcome,
}

/// 发布给订阅方的只读状态视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchSnapshot {
    pub handle: String,
    pub quality: Quality,
    /// false 表示定时轮询已暂停，手动检查仍可用
    pub enabled: bool,
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub title: Option<String>,
    pub metrics: Option<SessionMetrics>,
    pub recording_path: Option<PathBuf>,
    pub preview_attached: bool,
}

impl WatchSnapshot {
    pub fn idle(user: &MonitoredUser) -> Self {
        Self {
            handle: user.handle.clone(),
            quality: user.quality,
            enabled: user.enabled,
            phase: Phase::Idle,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
            title: None,
            metrics: None,
            recording_path: None,
            preview_attached: false,
        }
    }
}

/// HH:MM:SS
pub fn format_duration(secs: u64) -> String {
    let (h, rest) = (secs / 3600, secs % 3600);
    format!("{:02}:{:02}:{:02}", h, rest / 60, rest % 60)
}

pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}
