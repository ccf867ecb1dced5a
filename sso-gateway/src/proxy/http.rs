//! Single-shot HTTP proxying with HTML rewriting.
//!
//! Backends emit a small, predictable set of HTML pages that embed their own
//! absolute origin and WebSocket URL. Those URLs are rewritten with literal
//! substring replacement so follow-up requests come back through the
//! gateway. This is a narrowing assumption about the backend's markup, not a
//! general HTML rewriter. Pages declaring a charset other than UTF-8 are
//! passed through untouched.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::registry::BackendAddr;

/// Injected before `</head>` of proxied HTML pages.
///
/// Focuses the terminal's helper textarea once it is rendered, and turns the
/// browser back button into an Escape keypress so the single-page app keeps
/// the user instead of navigating away.
pub const INJECTED_SCRIPT: &str = concat!(
    "<script>",
    "document.addEventListener(\"DOMContentLoaded\",()=>{",
    "let t=document.getElementById(\"terminal\");",
    "if(t){new MutationObserver((m,o)=>{",
    "let c=t.querySelector(\".xterm-helper-textarea\");",
    "if(c){c.focus();o.disconnect()}",
    "}).observe(t,{childList:true,subtree:true})}",
    "});",
    "history.pushState({app:true},\"\");",
    "window.addEventListener(\"popstate\",()=>{",
    "history.pushState({app:true},\"\");",
    "let c=document.querySelector(\".xterm-helper-textarea\");",
    "if(c){",
    "c.focus();",
    "c.dispatchEvent(new KeyboardEvent(\"keydown\",",
    "{key:\"Escape\",code:\"Escape\",keyCode:27,bubbles:true}));",
    "}",
    "});",
    "</script>",
);

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Issues upstream GETs and rewrites HTML responses.
#[derive(Debug, Clone)]
pub struct HttpProxy {
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(timeout: Option<Duration>) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetches `path_and_query` from `backend` and rewrites HTML bodies so
    /// that absolute backend URLs point at `/app/<app_name>/` on `gateway_authority`.
    ///
    /// `path_and_query` is relative to the backend root and must not start
    /// with a slash.
    pub async fn forward(
        &self,
        app_name: &str,
        backend: &BackendAddr,
        path_and_query: &str,
        gateway_authority: &str,
    ) -> Result<ProxiedResponse, GatewayError> {
        let url = format!("{}/{path_and_query}", backend.http_origin());
        debug!(app = %app_name, url = %url, "proxying request");

        let unavailable = |e: reqwest::Error| {
            warn!(app = %app_name, backend = %backend, error = %e, "upstream request failed");
            GatewayError::UpstreamUnavailable {
                backend: backend.to_string(),
                reason: e.to_string(),
            }
        };

        let resp = self.client.get(&url).send().await.map_err(unavailable)?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(unavailable)?;

        let body = match content_type.as_deref() {
            Some(ct) if is_rewritable_html(ct) => {
                let html = String::from_utf8_lossy(&body);
                Bytes::from(rewrite_html(&html, backend, app_name, gateway_authority))
            }
            _ => body,
        };

        Ok(ProxiedResponse {
            status,
            content_type,
            body,
        })
    }
}

/// `text/html` with no charset parameter or a UTF-8 one.
fn is_rewritable_html(content_type: &str) -> bool {
    let mut params = content_type.split(';').map(str::trim);
    if !params
        .next()
        .is_some_and(|mime| mime.eq_ignore_ascii_case("text/html"))
    {
        return false;
    }
    params
        .filter_map(|p| p.split_once('='))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
        .all(|(_, value)| {
            let value = value.trim().trim_matches('"');
            value.eq_ignore_ascii_case("utf-8") || value.eq_ignore_ascii_case("utf8")
        })
}

/// Rewrites backend URLs in an HTML page and injects [`INJECTED_SCRIPT`].
///
/// The WebSocket URL is replaced before the origin, since the origin rewrite
/// would otherwise also match inside it.
pub fn rewrite_html(
    html: &str,
    backend: &BackendAddr,
    app_name: &str,
    gateway_authority: &str,
) -> String {
    let gateway_base = format!("{gateway_authority}/app/{app_name}");
    html.replace(&backend.ws_url(), &format!("ws://{gateway_base}/ws"))
        .replace(
            &format!("{}/", backend.http_origin()),
            &format!("http://{gateway_base}/"),
        )
        .replace("</head>", &format!("{INJECTED_SCRIPT}</head>"))
}
