//! Core error types shared across the pipeline, upstream pool, and config store.
//!
//! Mirrors the error kinds in the spec's error table (§7): each variant knows
//! the HTTP status it should surface to the client, and whether it counts
//! toward an upstream's failure tracker.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Errors that can occur while a request moves through the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("request body is not valid JSON: {0}")]
    BadRequest(String),

    #[error("no active upstream configured for this family")]
    NoActiveUpstream,

    #[error("all eligible upstream configs are excluded or unconfigured")]
    UpstreamUnavailable,

    #[error("upstream returned HTTP {status}")]
    UpstreamHttp {
        status: StatusCode,
        body: bytes::Bytes,
        content_type: Option<String>,
    },

    #[error("transport error reaching upstream: {0}")]
    UpstreamIo(String),

    #[error("client disconnected before the response completed")]
    ClientDisconnect,

    #[error("rate limiter admission wait was cancelled")]
    RateWaitCancelled,
}

/// The stable machine-readable error kind, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ErrBadRequest,
    ErrNoActive,
    ErrUpstreamUnavail,
    ErrUpstreamHttp,
    ErrUpstreamIo,
    ErrClientDisconnect,
    ErrRateWaitCancel,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::ErrBadRequest,
            Self::NoActiveUpstream => ErrorKind::ErrNoActive,
            Self::UpstreamUnavailable => ErrorKind::ErrUpstreamUnavail,
            Self::UpstreamHttp { .. } => ErrorKind::ErrUpstreamHttp,
            Self::UpstreamIo(_) => ErrorKind::ErrUpstreamIo,
            Self::ClientDisconnect => ErrorKind::ErrClientDisconnect,
            Self::RateWaitCancelled => ErrorKind::ErrRateWaitCancel,
        }
    }

    /// Whether this outcome should increment the upstream's failure counter.
    /// Per spec §4.4/§7: 5xx and transport errors count; 4xx and cancellation don't.
    pub fn counts_as_upstream_failure(&self) -> bool {
        match self {
            Self::UpstreamIo(_) => true,
            Self::UpstreamHttp { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoActiveUpstream => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamHttp { status, .. } => *status,
            Self::UpstreamIo(_) => StatusCode::BAD_GATEWAY,
            Self::ClientDisconnect => StatusCode::INTERNAL_SERVER_ERROR, // connection already closed
            Self::RateWaitCancelled => StatusCode::from_u16(499).unwrap(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    kind: ErrorKind,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        // Upstream 4xx/5xx bodies are passed through unchanged (spec §7), not wrapped.
        if let Self::UpstreamHttp {
            status,
            body,
            content_type,
        } = &self
        {
            let mut builder = Response::builder().status(*status);
            if let Some(ct) = content_type {
                builder = builder.header(axum::http::header::CONTENT_TYPE, ct);
            }
            return builder
                .body(axum::body::Body::from(body.clone()))
                .unwrap_or_else(|_| {
                    (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
                });
        }

        let status = self.status_code();
        let kind = self.kind();
        let message = self.to_string();
        (status, Json(ErrorBody {
            error: ErrorDetail { message, kind },
        }))
            .into_response()
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
