use crate::error::EngineError;
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use std::path::{Component, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// 下载已完成的录像文件
pub async fn serve_recording(
    State(state): State<SharedState>,
    Path(file_name): Path<String>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. 只允许输出目录下的单个文件名
    let relative = PathBuf::from(&file_name);
    let plain = relative.components().count() == 1
        && matches!(relative.components().next(), Some(Component::Normal(_)));
    if !plain {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }
    let file_path = state.config.server.output_dir.join(relative);

    // 2. 打开文件
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;
    let length = file.metadata().await.map(|m| m.len()).ok();
    debug!("Serving recording {:?}", file_path);

    // 3. 根据扩展名推断 Content-Type
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    if let Some(length) = length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    builder
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// 最新的预览帧；预览未打开时返回 404，尚无画面时返回 204
pub async fn preview_frame(
    State(state): State<SharedState>,
    Path(handle): Path<String>,
) -> Result<Response<Body>, EngineError> {
    let Some(frame) = state.engine.preview_frame(&handle).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        frame,
    )
        .into_response())
}
