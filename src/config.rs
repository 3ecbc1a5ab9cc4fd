use crate::model::{ErrorKind, Quality};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    /// 解析失败重试策略
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// 启动时加入监控列表的账号 (与持久化列表合并)
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_binary: String,
    /// 直播地址解析工具 (yt-dlp)
    #[serde(default = "default_resolver")]
    pub resolver_binary: String,

    /// 录像输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 监控列表与录制历史的存储文件
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// 浏览器导出的 cookies.txt，部分直播间需要登录态
    #[serde(default)]
    pub cookies_file: Option<PathBuf>,
    /// 文件名模板，支持 {handle} {date} {time} {datetime}
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,
    /// 录制结束后将 FLV 转封装为 MP4
    #[serde(default = "default_true")]
    pub remux_to_mp4: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ffmpeg_binary: default_ffmpeg(),
            resolver_binary: default_resolver(),
            output_dir: default_output_dir(),
            data_file: default_data_file(),
            cookies_file: None,
            filename_pattern: default_filename_pattern(),
            remux_to_mp4: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// 轮询间隔 (秒)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 轮询抖动比例，0.2 表示 ±20%
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// 检测到开播后自动录制
    #[serde(default = "default_true")]
    pub auto_record: bool,
    /// 录制进程中断后重新解析并续录
    #[serde(default = "default_true")]
    pub auto_resume: bool,
    /// 续录宽限期 (秒)
    #[serde(default = "default_resume_grace")]
    pub resume_grace_secs: u64,
    /// 同时录制的最大会话数
    #[serde(default = "default_max_recordings")]
    pub max_concurrent_recordings: usize,
    /// 录制指标采样间隔 (毫秒)
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_ms: u64,
    /// 优雅停止超时 (秒)，超时后强制结束进程
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// 每个订阅者的事件队列长度
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            jitter: default_jitter(),
            auto_record: true,
            auto_resume: true,
            resume_grace_secs: default_resume_grace(),
            max_concurrent_recordings: default_max_recordings(),
            metrics_interval_ms: default_metrics_interval(),
            stop_timeout_secs: default_stop_timeout(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 连续失败多少次后向用户报告并放弃本轮重试
    pub max_attempts: u32,
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
    /// 限流时的最小退避时间 (秒)
    pub rate_limited_floor_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_sec: 5,
            max_backoff_sec: 300,
            rate_limited_floor_sec: default_rate_limited_floor(),
        }
    }
}

impl RetryPolicy {
    /// 第 `failures` 次连续失败后的退避时间 (指数退避，封顶 max_backoff_sec)
    pub fn delay_for(&self, failures: u32, kind: ErrorKind) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let backoff_sec = std::cmp::min(
            self.max_backoff_sec,
            self.initial_backoff_sec.saturating_mul(2u64.pow(exp)),
        );
        let backoff_sec = if kind == ErrorKind::RateLimited {
            backoff_sec.max(self.rate_limited_floor_sec.min(self.max_backoff_sec))
        } else {
            backoff_sec
        };
        Duration::from_secs(backoff_sec)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default = "default_true")]
    pub on_live: bool,
    #[serde(default = "default_true")]
    pub on_record_start: bool,
    #[serde(default = "default_true")]
    pub on_record_end: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            on_live: true,
            on_record_start: true,
            on_record_end: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UserConfig {
    pub handle: String,
    #[serde(default)]
    pub quality: Quality,
}

fn default_listen() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_resolver() -> String {
    "yt-dlp".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./recordings")
}

fn default_data_file() -> PathBuf {
    PathBuf::from("./live-recorder.json")
}

fn default_filename_pattern() -> String {
    "{handle}_{datetime}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60
}

fn default_jitter() -> f64 {
    0.2
}

fn default_resume_grace() -> u64 {
    60
}

fn default_max_recordings() -> usize {
    4
}

fn default_metrics_interval() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_event_buffer() -> usize {
    256
}

fn default_rate_limited_floor() -> u64 {
    60
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
