//! Error types for the gateway.
//!
//! Configuration errors abort startup. Everything else is scoped to a single
//! request or connection and is turned into an HTTP response (or a WebSocket
//! close code) at the router boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

/// Malformed or missing startup configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingSecret(&'static str),

    #[error("invalid APPS entry: {entry:?} (expected name:port or name:host:port)")]
    InvalidAppEntry { entry: String },

    #[error("invalid port in APPS entry {entry:?}: {reason}")]
    InvalidPort { entry: String, reason: String },

    #[error("duplicate app name in APPS: {0:?}")]
    DuplicateApp(String),

    #[error("invalid identity provider URL {url:?}: {reason}")]
    InvalidProviderUrl { url: String, reason: String },

    #[error("invalid session TTL of {secs}s: {reason}")]
    InvalidSessionTtl { secs: u64, reason: &'static str },
}

/// Per-request failures surfaced by the proxy paths.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("upstream {backend} unavailable: {reason}")]
    UpstreamUnavailable { backend: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// WebSocket close code used when the failure happens on an upgraded connection.
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 4401,
            Self::AppNotFound(_) => 4404,
            Self::UpstreamUnavailable { .. } | Self::Internal(_) => 1011,
        }
    }

    /// Human readable close reason matching [`Self::close_code`].
    pub const fn close_reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::AppNotFound(_) => "App not found",
            Self::UpstreamUnavailable { .. } | Self::Internal(_) => "Backend connection failed",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match &self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            Self::AppNotFound(name) => {
                (StatusCode::NOT_FOUND, format!("App not found: {name}")).into_response()
            }
            Self::UpstreamUnavailable { backend, reason } => {
                warn!(backend = %backend, reason = %reason, "upstream unavailable");
                (StatusCode::BAD_GATEWAY, "Backend unavailable").into_response()
            }
            Self::Internal(msg) => {
                error!(error = %msg, "internal gateway error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

/// Failures of the external login handshake.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login state mismatch")]
    StateMismatch,

    #[error("missing authorization code")]
    MissingCode,

    #[error("identity provider request failed: {0}")]
    Provider(#[from] reqwest::Error),

    #[error("identity provider rejected the exchange: {0}")]
    Rejected(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        warn!(error = %self, "login failed");
        let status = match self {
            Self::StateMismatch | Self::MissingCode => StatusCode::BAD_REQUEST,
            Self::Provider(_) | Self::Rejected(_) => StatusCode::BAD_GATEWAY,
        };
        (status, "Login failed").into_response()
    }
}
