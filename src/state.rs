use crate::config::AppConfig;
use crate::engine::Engine;
use std::sync::Arc;
use std::time::Instant;

/// 全局应用上下文 (Web 层持有)
pub struct AppState {
    pub config: AppConfig,
    /// 监控与录制引擎
    pub engine: Arc<Engine>,
    /// 进程启动时间 (用于计算运行时长)
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<Engine>) -> Self {
        Self {
            config,
            engine,
            started_at: Instant::now(),
        }
    }
}

pub type SharedState = Arc<AppState>;
