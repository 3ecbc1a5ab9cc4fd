use crate::error::EngineError;
use crate::model::{format_duration, format_size, normalize_handle, Quality, RecordOutcome};
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

/// 提供内嵌的管理后台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 返回系统的内存、负载与引擎运行信息
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let engine = &state.engine;

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "poll_interval_seconds": engine.poll_interval().as_secs(),
        "cookies_file": engine.cookies_file(),
        "output_dir": state.config.server.output_dir,
    }))
}

/// 获取监控列表 API
pub async fn list_users(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let users: Vec<_> = state
        .engine
        .snapshots()
        .into_iter()
        .map(|s| {
            let (elapsed, size) = s
                .metrics
                .map(|m| (format_duration(m.elapsed_secs), format_size(m.bytes_written)))
                .unzip();
            serde_json::json!({
                "snapshot": s,
                "elapsed": elapsed,
                "size": size,
            })
        })
        .collect();
    Json(serde_json::json!({ "users": users }))
}

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub handle: String,
    #[serde(default)]
    pub quality: Quality,
}

/// 添加账号 API
pub async fn add_user(
    State(state): State<SharedState>,
    Json(req): Json<AddUserRequest>,
) -> Result<Response, EngineError> {
    let snapshot = state.engine.add_user(&req.handle, req.quality).await?;
    Ok((StatusCode::CREATED, Json(snapshot)).into_response())
}

/// 单个账号的当前状态
pub async fn get_user(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let snapshot = state.engine.snapshot(&handle)?;
    Ok(Json(serde_json::json!({ "snapshot": snapshot })))
}

/// 移除账号 API (录制中会先停止录制)
pub async fn remove_user(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.remove_user(&handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

/// 暂停或恢复定时轮询 API
pub async fn set_enabled(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let snapshot = state.engine.set_enabled(&handle, req.enabled).await?;
    Ok(Json(serde_json::json!({ "snapshot": snapshot })))
}

/// 手动检查 API
pub async fn check_now(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.check_now(&handle).await?;
    Ok(StatusCode::ACCEPTED)
}

/// 手动开始录制 API
pub async fn start_recording(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let path = state.engine.start_recording(&handle).await?;
    Ok(Json(serde_json::json!({ "handle": handle, "path": path })))
}

/// 手动停止录制 API
pub async fn stop_recording(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let outcome: RecordOutcome = state.engine.stop_recording(&handle).await?;
    Ok(Json(serde_json::json!({ "handle": handle, "outcome": outcome })))
}

pub async fn attach_preview(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.attach_preview(&handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn detach_preview(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<StatusCode, EngineError> {
    state.engine.detach_preview(&handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// 录制历史 API，最新的在前
pub async fn history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let entries = state.engine.history(query.limit).await?;
    Ok(Json(serde_json::json!({ "history": entries })))
}

pub async fn stats(State(state): State<SharedState>) -> Result<Json<serde_json::Value>, EngineError> {
    let stats = state.engine.stats().await?;
    Ok(Json(serde_json::json!({
        "stats": stats,
        "total_size": format_size(stats.total_bytes),
        "total_duration": format_duration(stats.total_seconds),
    })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// 只推送该账号的事件
    pub handle: Option<String>,
}

/// 引擎事件流 (SSE)，事件名即事件类型
pub async fn events(
    State(state): State<SharedState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let subscription = state.engine.subscribe();
    let filter = query.handle.and_then(|h| normalize_handle(&h));
    let stream = stream::unfold((subscription, filter), |(mut sub, filter)| async move {
        let event = loop {
            let event = sub.recv().await?;
            if filter.as_deref().map_or(true, |h| event.handle() == h) {
                break event;
            }
        };
        let sse = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event"));
        Some((Ok::<Event, Infallible>(sse), (sub, filter)))
    })
    .take_until(state.engine.shutdown_token().cancelled_owned());

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    let mut resp = sse.into_response();
    resp.headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    resp
}

#[derive(Debug, Deserialize)]
pub struct PollIntervalRequest {
    pub seconds: u64,
}

pub async fn set_poll_interval(
    State(state): State<SharedState>,
    Json(req): Json<PollIntervalRequest>,
) -> Json<serde_json::Value> {
    let applied = state
        .engine
        .set_poll_interval(Duration::from_secs(req.seconds));
    Json(serde_json::json!({ "poll_interval_seconds": applied.as_secs() }))
}

#[derive(Debug, Deserialize)]
pub struct CookiesRequest {
    pub path: Option<PathBuf>,
}

/// 更新 cookies 文件路径；之后可对 Error 状态的账号手动检查
pub async fn set_cookies(
    State(state): State<SharedState>,
    Json(req): Json<CookiesRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if let Some(path) = &req.path {
        if !path.is_file() {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("cookies file not found: {}", path.display()),
            ));
        }
    }
    state.engine.set_cookies_file(req.path);
    Ok(StatusCode::NO_CONTENT)
}
