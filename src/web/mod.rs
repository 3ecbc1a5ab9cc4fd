pub mod admin;
pub mod media;

use crate::state::SharedState;
use axum::{
    routing::{get, post, put},
    Router,
};

/// 注册所有 HTTP 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(admin::index_handler)) // 首页
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/users", get(admin::list_users).post(admin::add_user)) // 监控列表
        .route(
            "/users/:handle",
            get(admin::get_user).delete(admin::remove_user),
        ) // 查询 / 移除账号
        .route("/users/:handle/enabled", put(admin::set_enabled)) // 暂停/恢复轮询
        .route("/users/:handle/check", post(admin::check_now)) // 立即检查
        .route("/users/:handle/record/start", post(admin::start_recording)) // 开始录制
        .route("/users/:handle/record/stop", post(admin::stop_recording)) // 停止录制
        .route("/users/:handle/preview/attach", post(admin::attach_preview)) // 打开预览
        .route("/users/:handle/preview/detach", post(admin::detach_preview)) // 关闭预览
        .route("/users/:handle/preview.jpg", get(media::preview_frame)) // 最新预览帧
        .route("/history", get(admin::history)) // 录制历史
        .route("/stats", get(admin::stats)) // 统计
        .route("/events", get(admin::events)) // SSE 事件流
        .route("/settings/poll-interval", put(admin::set_poll_interval))
        .route("/settings/cookies", put(admin::set_cookies))
        .route("/recordings/:file_name", get(media::serve_recording)) // 下载录像
        .with_state(state)
}
