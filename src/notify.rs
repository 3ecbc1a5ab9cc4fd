use crate::bus::{EngineEvent, Subscription};
use crate::config::{NotifyConfig, TelegramConfig};
use crate::model::{format_duration, format_size, Phase, RecordOutcome};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

pub struct TelegramSink {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(config: &TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("https://api.telegram.org/bot{}/sendMessage", config.bot_token),
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": message,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .context("telegram request failed")?
            .error_for_status()
            .context("telegram rejected message")?;
        Ok(())
    }
}

/// 未配置任何通道时只写日志
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &str) -> anyhow::Result<()> {
        info!("[notify] {}", message.replace('\n', " | "));
        Ok(())
    }
}

pub fn sink_from_config(config: &NotifyConfig) -> anyhow::Result<Arc<dyn NotificationSink>> {
    if config.telegram.is_usable() {
        Ok(Arc::new(TelegramSink::new(&config.telegram)?))
    } else {
        if config.telegram.enabled {
            warn!("Telegram enabled without bot_token/chat_id, falling back to log output");
        }
        Ok(Arc::new(LogSink))
    }
}

/// 通知分发器
///
/// 订阅事件总线，把开播、开始录制、录制结束转成文本消息。
/// 开播消息每场直播只发一次：账号回到 Offline 或 Idle、或被移除后才会再次提醒。
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    on_live: bool,
    on_record_start: bool,
    on_record_end: bool,
    retry_delay: Duration,
    /// 本次直播已通知过的账号
    notified: HashSet<String>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, config: &NotifyConfig) -> Self {
        Self {
            sink,
            on_live: config.on_live,
            on_record_start: config.on_record_start,
            on_record_end: config.on_record_end,
            retry_delay: Duration::from_secs(2),
            notified: HashSet::new(),
        }
    }

    /// 根据事件生成要发送的消息，同时更新去重状态
    pub fn handle_event(&mut self, event: &EngineEvent) -> Option<String> {
        match event {
            EngineEvent::LiveDetected {
                handle,
                title,
                viewers,
            } => {
                if !self.notified.insert(handle.clone()) {
                    debug!("@{} already notified for this live session", handle);
                    return None;
                }
                self.on_live.then(|| {
                    format!(
                        "@{} is LIVE\n{}\nViewers: {}\nhttps://www.tiktok.com/@{}/live",
                        handle, title, viewers, handle
                    )
                })
            }
            // 下播、放弃重试或刚恢复监控时，上一场直播视为结束
            EngineEvent::PhaseChanged { snapshot }
                if matches!(snapshot.phase, Phase::Offline | Phase::Idle) =>
            {
                self.notified.remove(&snapshot.handle);
                None
            }
            EngineEvent::UserRemoved { handle } => {
                self.notified.remove(handle);
                None
            }
            EngineEvent::RecordingStarted { handle, path } => self.on_record_start.then(|| {
                let file = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("Recording @{}\n{}", handle, file)
            }),
            EngineEvent::RecordingFinished { entry } => self.on_record_end.then(|| {
                let verdict = match entry.outcome {
                    RecordOutcome::Completed => "Recording finished",
                    RecordOutcome::Interrupted => "Recording interrupted",
                    RecordOutcome::Failed => "Recording failed",
                };
                format!(
                    "{}: @{}\nDuration: {}\nSize: {}",
                    verdict,
                    entry.handle,
                    format_duration(entry.duration_seconds),
                    format_size(entry.size_bytes)
                )
            }),
            _ => None,
        }
    }

    pub async fn run(mut self, mut events: Subscription, cancel: CancellationToken) {
        info!("Notification dispatcher started ({})", self.sink.name());
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Some(message) = self.handle_event(&event) {
                tokio::spawn(deliver(self.sink.clone(), message, self.retry_delay));
            }
        }
        info!(
            "Notification dispatcher stopped ({} events missed)",
            events.dropped()
        );
    }
}

/// 失败最多重试一次，仍失败只记日志
async fn deliver(sink: Arc<dyn NotificationSink>, message: String, retry_delay: Duration) -> bool {
    for attempt in 1..=2 {
        match sink.send(&message).await {
            Ok(()) => return true,
            Err(e) if attempt == 1 => {
                warn!("Notification via {} failed, retrying: {:#}", sink.name(), e);
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => warn!("Notification via {} dropped: {:#}", sink.name(), e),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::model::{Quality, RecordHistoryEntry, WatchSnapshot};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for MemorySink {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn send(&self, message: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingSink {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn send(&self, _message: &str) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("unreachable")
        }
    }

    fn live(handle: &str) -> EngineEvent {
        EngineEvent::LiveDetected {
            handle: handle.to_string(),
            title: "hi".to_string(),
            viewers: 10,
        }
    }

    fn phase(handle: &str, phase: Phase) -> EngineEvent {
        let mut snapshot =
            WatchSnapshot::idle(&crate::model::MonitoredUser::new(handle, Quality::Best));
        snapshot.phase = phase;
        EngineEvent::PhaseChanged { snapshot }
    }

    fn dispatcher() -> NotificationDispatcher {
        NotificationDispatcher::new(Arc::new(LogSink), &NotifyConfig::default())
    }

    #[test]
    fn one_alert_per_live_session() {
        let mut d = dispatcher();
        assert!(d.handle_event(&live("alice")).is_some());
        // 重试、预览、录制都不会再次触发
        assert!(d.handle_event(&live("alice")).is_none());
        assert!(d.handle_event(&phase("alice", Phase::Recording)).is_none());
        assert!(d.handle_event(&phase("alice", Phase::Stopped)).is_none());
        assert!(d.handle_event(&live("alice")).is_none());
        assert!(d.handle_event(&live("bob")).is_some());

        d.handle_event(&phase("alice", Phase::Offline));
        assert!(d.handle_event(&live("alice")).is_some());

        d.handle_event(&EngineEvent::UserRemoved {
            handle: "bob".to_string(),
        });
        assert!(d.handle_event(&live("bob")).is_some());
    }

    #[test]
    fn giving_up_ends_the_live_session() {
        let mut d = dispatcher();
        assert!(d.handle_event(&live("erin")).is_some());
        // 录制中断、重试失败都不算下播
        assert!(d.handle_event(&phase("erin", Phase::Error)).is_none());
        assert!(d.handle_event(&live("erin")).is_none());

        // 重试耗尽回到 Idle，之后再次开播需要重新提醒
        d.handle_event(&phase("erin", Phase::Error));
        d.handle_event(&phase("erin", Phase::Idle));
        assert!(d.handle_event(&live("erin")).is_some());
    }

    #[test]
    fn disabled_alerts_still_track_sessions() {
        let mut config = NotifyConfig::default();
        config.on_live = false;
        let mut d = NotificationDispatcher::new(Arc::new(LogSink), &config);
        assert!(d.handle_event(&live("alice")).is_none());
        d.on_live = true;
        assert!(d.handle_event(&live("alice")).is_none());
    }

    #[test]
    fn recording_messages_include_summary() {
        let mut d = dispatcher();
        d.on_record_end = true;
        let entry = RecordHistoryEntry {
            handle: "carol".to_string(),
            title: "t".to_string(),
            file_path: PathBuf::from("/rec/carol.mp4"),
            started_at: chrono::Utc::now(),
            duration_seconds: 3725,
            size_bytes: 5 * 1024 * 1024,
            outcome: RecordOutcome::Completed,
        };
        let msg = d
            .handle_event(&EngineEvent::RecordingFinished { entry })
            .unwrap();
        assert!(msg.contains("@carol"));
        assert!(msg.contains("01:02:05"));
        assert!(msg.contains("5.0 MB"));
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_once() {
        let sink = Arc::new(FailingSink::default());
        let delivered = deliver(sink.clone(), "x".to_string(), Duration::from_millis(10)).await;
        assert!(!delivered);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatcher_sends_through_sink() {
        let bus = EventBus::new(16);
        let sink = Arc::new(MemorySink::default());
        let d = NotificationDispatcher::new(sink.clone(), &NotifyConfig::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(d.run(bus.subscribe(), cancel.clone()));

        bus.publish(live("dana"));
        bus.publish(live("dana"));
        bus.publish(phase("dana", Phase::Offline));
        bus.publish(live("dana"));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sink.sent.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("@dana is LIVE"));
    }
}
