mod bus;
mod config;
mod engine;
mod error;
mod machine;
mod model;
mod notify;
mod preview;
mod process;
mod recording;
mod resolver;
mod scheduler;
mod state;
mod store;
mod watcher;
mod web;

use clap::Parser;
use config::AppConfig;
use engine::Engine;
use notify::NotificationDispatcher;
use recording::FfmpegRecorder;
use resolver::YtDlpResolver;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use store::JsonFileStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Live Recorder - 直播监控与录制服务
/// 解析命令行参数，加载配置文件，启动监控引擎、通知与 HTTP 服务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "live-recorder.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!(
        "Live Recorder initialized. Output: {:?}",
        config.server.output_dir
    );
    tokio::fs::create_dir_all(&config.server.output_dir).await?;

    // 构建引擎：持久化存储 + yt-dlp 解析 + ffmpeg 录制
    let store = Arc::new(JsonFileStore::open(&config.server.data_file).await?);
    let engine = Arc::new(Engine::new(
        &config,
        Arc::new(YtDlpResolver::new(config.server.resolver_binary.clone())),
        Arc::new(FfmpegRecorder::new(config.server.ffmpeg_binary.clone())),
        store,
    ));

    // 启动通知分发
    let sink = notify::sink_from_config(&config.notify)?;
    let dispatcher = NotificationDispatcher::new(sink, &config.notify);
    tokio::spawn(dispatcher.run(engine.subscribe(), engine.shutdown_token()));

    // 恢复监控列表
    engine.restore_watchlist(&config.users).await?;

    let state = Arc::new(AppState::new(config.clone(), engine.clone()));
    let app = web::router(state);

    // 启动HTTP服务，Ctrl-C 时优雅退出
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    let shutdown = engine.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
                _ = shutdown.cancelled() => {}
            }
            // 结束 SSE 连接与通知任务
            shutdown.cancel();
        })
        .await?;

    // 停止所有录制并等待文件封装完成
    let grace = Duration::from_secs(config.watch.stop_timeout_secs + 10);
    engine.shutdown(grace).await;

    Ok(())
}
