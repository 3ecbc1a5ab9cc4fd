use crate::model::Phase;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// 同步返回给控制端的错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid handle: {0:?}")]
    InvalidHandle(String),
    #[error("@{0} is not on the watchlist")]
    UnknownUser(String),
    #[error("@{0} is already on the watchlist")]
    AlreadyWatched(String),
    #[error("cannot {action} @{handle} while {phase}")]
    InvalidState {
        handle: String,
        phase: Phase,
        action: &'static str,
    },
    #[error("a preview is already attached to @{0}")]
    AlreadyAttached(String),
    #[error("no preview attached to @{0}")]
    NotAttached(String),
    #[error("no resolved stream for @{0}")]
    NoResolvedStream(String),
    #[error("recording limit reached ({0} concurrent sessions)")]
    ConcurrencyLimit(usize),
    #[error("insufficient system memory ({0} KB available)")]
    LowMemory(u64),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(String),
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Store(format!("{:#}", err))
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::InvalidHandle(_) => StatusCode::BAD_REQUEST,
            EngineError::UnknownUser(_) | EngineError::NotAttached(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyWatched(_)
            | EngineError::InvalidState { .. }
            | EngineError::AlreadyAttached(_)
            | EngineError::NoResolvedStream(_) => StatusCode::CONFLICT,
            EngineError::ConcurrencyLimit(_) | EngineError::LowMemory(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Spawn { .. } | EngineError::Io(_) | EngineError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
