//! Server error surface: HTTP status mapping plus a JSON body carrying
//! the short message, the error kind tag and the failing operation name.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use sparmap_cache::CacheError;
use sparmap_render::RenderError;
use sparmap_session::SessionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{source}")]
    Session {
        op: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("{source}")]
    Render {
        op: &'static str,
        #[source]
        source: RenderError,
    },

    #[error("internal error in {op}: {message}")]
    Internal { op: &'static str, message: String },
}

/// Result type for handlers.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
    op: &'a str,
}

impl ServerError {
    pub fn session(op: &'static str) -> impl FnOnce(SessionError) -> Self {
        move |source| Self::Session { op, source }
    }

    pub fn render(op: &'static str) -> impl FnOnce(RenderError) -> Self {
        move |source| Self::Render { op, source }
    }

    fn op(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "request",
            Self::Session { op, .. } | Self::Render { op, .. } | Self::Internal { op, .. } => op,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Render { source: RenderError::Invalid(_), .. } => "bad_request",
            Self::Render { source: RenderError::Encode(_), .. } => "render",
            Self::Render { source: RenderError::Session(s), .. } => session_kind(s),
            Self::Session { source, .. } => session_kind(source),
            Self::Internal { .. } => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            "bad_request" => StatusCode::BAD_REQUEST,
            "unknown_session" => StatusCode::NOT_FOUND,
            "cache_not_ready" | "not_ready" => StatusCode::CONFLICT,
            "out_of_memory" => StatusCode::INSUFFICIENT_STORAGE,
            "backend_transport" | "backend_protocol" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn session_kind(e: &SessionError) -> &'static str {
    match e {
        SessionError::CacheNotReady => "cache_not_ready",
        SessionError::NotReady => "not_ready",
        SessionError::OutOfMemory { .. } => "out_of_memory",
        SessionError::Cancelled(_) => "cancelled",
        SessionError::UnknownSession(_) => "unknown_session",
        SessionError::Cache(c) => match c {
            CacheError::NotReady => "cache_not_ready",
            CacheError::OutOfMemory { .. } => "out_of_memory",
            CacheError::Transport(_) => "backend_transport",
            CacheError::Protocol(_) | CacheError::Format(_) => "backend_protocol",
            CacheError::Io(_) => "io",
        },
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
            op: self.op(),
        };
        if status.is_server_error() {
            tracing::error!(op = body.op, kind = body.kind, error = %body.error, "request failed");
        } else {
            tracing::debug!(op = body.op, kind = body.kind, error = %body.error, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}
