use crate::model::{ErrorKind, Quality, ResolvedStream};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tracing::{debug, error, warn};

/// 传给解析器的登录凭据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub cookies_file: Option<PathBuf>,
}

/// 直播地址解析
///
/// 封装外部提取工具，结果只会是 `ResolvedStream` 或某个 `ErrorKind`。
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        handle: &str,
        quality: Quality,
        auth: &AuthContext,
    ) -> Result<ResolvedStream, ErrorKind>;
}

pub fn live_page_url(handle: &str) -> String {
    format!("https://www.tiktok.com/@{}/live", handle)
}

/// 通过 `yt-dlp -J` 解析
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(
        &self,
        handle: &str,
        quality: Quality,
        auth: &AuthContext,
    ) -> Result<ResolvedStream, ErrorKind> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-J").arg("--no-warnings");
        if let Some(cookies) = auth.cookies_file.as_ref().filter(|p| p.exists()) {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(live_page_url(handle));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Failed to run resolver {}: {}", self.binary, e);
                return Err(ErrorKind::Unknown);
            }
            Err(_) => {
                warn!("Resolver timed out for @{}", handle);
                return Err(ErrorKind::NetworkError);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = classify_failure(&stderr);
            debug!("Resolver failed for @{} ({}): {}", handle, kind, stderr.trim());
            return Err(kind);
        }

        parse_info(&output.stdout, quality)
    }
}

/// 把提取工具的错误输出归类为固定的错误种类
pub fn classify_failure(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["not currently live", "offline", "is not live", "not hosting"]) {
        ErrorKind::NotLive
    } else if has(&["captcha", "verify", "cookies", "login", "log in", "private"]) {
        ErrorKind::AuthRequired
    } else if has(&["429", "too many requests", "rate limit", "rate-limit"]) {
        ErrorKind::RateLimited
    } else if has(&[
        "timed out",
        "timeout",
        "connection",
        "network",
        "resolve host",
        "temporary failure",
    ]) {
        ErrorKind::NetworkError
    } else {
        ErrorKind::Unknown
    }
}

#[derive(Debug, Deserialize)]
struct LiveInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    concurrent_view_count: Option<u64>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    #[serde(default)]
    format_id: String,
    #[serde(default)]
    url: Option<String>,
}

fn parse_info(raw: &[u8], quality: Quality) -> Result<ResolvedStream, ErrorKind> {
    let info: LiveInfo = serde_json::from_slice(raw).map_err(|e| {
        warn!("Unparsable resolver output: {}", e);
        ErrorKind::Unknown
    })?;

    if info.is_live == Some(false) {
        return Err(ErrorKind::NotLive);
    }

    let url = select_format(&info.formats, quality)
        .or(info.url.clone())
        .ok_or(ErrorKind::Unknown)?;

    Ok(ResolvedStream {
        expires_hint: expiry_hint(&url, SystemTime::now()),
        url,
        quality,
        title: info.title.unwrap_or_else(|| "TikTok Live".to_string()),
        viewers: info.concurrent_view_count.unwrap_or(0),
    })
}

/// 优先选择 id 含偏好关键字的格式，否则取第一个带地址的格式
fn select_format(formats: &[FormatInfo], quality: Quality) -> Option<String> {
    for pref in quality.preferences() {
        let found = formats.iter().find(|f| {
            f.url.is_some() && f.format_id.to_lowercase().contains(pref)
        });
        if let Some(f) = found {
            return f.url.clone();
        }
    }
    formats.iter().find_map(|f| f.url.clone())
}

/// CDN 地址带有 `expire=<unix 秒>` 参数
fn expiry_hint(url: &str, now: SystemTime) -> Option<Duration> {
    let query = url.split_once('?')?.1;
    let expire: u64 = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("expire="))?
        .parse()
        .ok()?;
    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(expire.saturating_sub(now)))
}
