use crate::model::{ErrorKind, RecordHistoryEntry, SessionMetrics, WatchSnapshot};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    UserAdded {
        handle: String,
    },
    UserRemoved {
        handle: String,
    },
    PhaseChanged {
        snapshot: WatchSnapshot,
    },
    LiveDetected {
        handle: String,
        title: String,
        viewers: u64,
    },
    NeedsCookies {
        handle: String,
    },
    /// 需要提示用户的错误：致命解析错误或连续临时错误过多
    Warning {
        handle: String,
        kind: ErrorKind,
        failures: u32,
        message: String,
    },
    RecordingStarted {
        handle: String,
        path: PathBuf,
    },
    RecordingFinished {
        entry: RecordHistoryEntry,
    },
    MetricsTick {
        handle: String,
        metrics: SessionMetrics,
    },
}

impl EngineEvent {
    pub fn handle(&self) -> &str {
        match self {
            EngineEvent::UserAdded { handle }
            | EngineEvent::UserRemoved { handle }
            | EngineEvent::LiveDetected { handle, .. }
            | EngineEvent::NeedsCookies { handle }
            | EngineEvent::Warning { handle, .. }
            | EngineEvent::RecordingStarted { handle, .. }
            | EngineEvent::MetricsTick { handle, .. } => handle,
            EngineEvent::PhaseChanged { snapshot } => &snapshot.handle,
            EngineEvent::RecordingFinished { entry } => &entry.handle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::UserAdded { .. } => "user_added",
            EngineEvent::UserRemoved { .. } => "user_removed",
            EngineEvent::PhaseChanged { .. } => "phase_changed",
            EngineEvent::LiveDetected { .. } => "live_detected",
            EngineEvent::NeedsCookies { .. } => "needs_cookies",
            EngineEvent::Warning { .. } => "warning",
            EngineEvent::RecordingStarted { .. } => "recording_started",
            EngineEvent::RecordingFinished { .. } => "recording_finished",
            EngineEvent::MetricsTick { .. } => "metrics_tick",
        }
    }
}

/// 进程内事件总线 (基于 broadcast)
///
/// 发布方从不等待；订阅方各自有一个有限窗口，落后时最旧的事件先被丢弃。
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// 不阻塞；没有订阅者也不算错误
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<EngineEvent>,
    dropped: u64,
}

impl Subscription {
    /// 下一个事件，跳过因落后丢失的部分；总线关闭后返回 None
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!("Event subscriber lagged, dropped {} oldest events", n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 因落后而丢失的事件总数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
