//! Command line and environment configuration.
//!
//! Every setting can come from a flag or from the environment variable named
//! next to it. Secrets are required; an empty secret is treated as missing.

use std::time::Duration;

use clap::Parser;

use crate::auth::{
    OidcEndpoints, GOOGLE_AUTHORIZATION_URL, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL,
};
use crate::error::ConfigError;
use crate::policy::AccessPolicy;
use crate::registry::AppRegistry;

/// sso-gateway: authenticated gateway for backend web apps
#[derive(Parser, Debug, Clone)]
#[command(name = "sso-gateway", version, about = "Authenticated gateway for backend web apps")]
pub struct Cli {
    /// Bind address
    #[arg(long, env = "SSO_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, env = "SSO_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Secret used to sign session cookies
    #[arg(long, env = "SECRET_KEY", default_value = "", hide_env_values = true)]
    pub secret_key: String,

    /// OAuth client id
    #[arg(long, env = "GOOGLE_CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// OAuth client secret
    #[arg(long, env = "GOOGLE_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub client_secret: String,

    /// Comma separated list of allowed emails
    #[arg(long, env = "ALLOWED_EMAILS", default_value = "")]
    pub allowed_emails: String,

    /// Allowed email domain (e.g. example.com)
    #[arg(long, env = "ALLOWED_DOMAIN", default_value = "")]
    pub allowed_domain: String,

    /// Apps to expose as name:port or name:host:port, comma separated
    #[arg(long, env = "APPS", default_value = "")]
    pub apps: String,

    /// OpenID Connect authorization endpoint
    #[arg(long, env = "OIDC_AUTHORIZATION_URL", default_value = GOOGLE_AUTHORIZATION_URL)]
    pub authorization_url: String,

    /// OpenID Connect token endpoint
    #[arg(long, env = "OIDC_TOKEN_URL", default_value = GOOGLE_TOKEN_URL)]
    pub token_url: String,

    /// OpenID Connect userinfo endpoint
    #[arg(long, env = "OIDC_USERINFO_URL", default_value = GOOGLE_USERINFO_URL)]
    pub userinfo_url: String,

    /// External base URL of the gateway, used for the login callback
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    /// External host:port used when rewriting backend URLs (defaults to the Host header)
    #[arg(long, env = "PUBLIC_AUTHORITY")]
    pub public_authority: Option<String>,

    /// Timeout for upstream HTTP requests in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    /// Timeout for connecting to a backend WebSocket in seconds
    #[arg(long, env = "WS_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ws_connect_timeout_secs: u64,

    /// Session lifetime in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 14 * 24 * 3600)]
    pub session_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

/// OAuth client settings.
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub client_id: String,
    pub client_secret: String,
    pub endpoints: OidcEndpoints,
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub secret_key: String,
    pub oidc: OidcSettings,
    pub policy: AccessPolicy,
    pub registry: AppRegistry,
    pub public_url: Option<String>,
    pub public_authority: Option<String>,
    pub upstream_timeout: Duration,
    pub ws_connect_timeout: Duration,
    pub session_ttl: chrono::Duration,
}

impl Cli {
    /// Validates the raw settings. Any error here must stop the process
    /// before it serves traffic.
    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let secret_key = required("SECRET_KEY", self.secret_key)?;
        let client_id = required("GOOGLE_CLIENT_ID", self.client_id)?;
        let client_secret = required("GOOGLE_CLIENT_SECRET", self.client_secret)?;
        let endpoints =
            OidcEndpoints::parse(&self.authorization_url, &self.token_url, &self.userinfo_url)?;
        let registry = AppRegistry::parse(&self.apps)?;
        let policy = AccessPolicy::from_config(&self.allowed_emails, &self.allowed_domain);
        let session_ttl = session_ttl(self.session_ttl_secs)?;

        Ok(GatewayConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            secret_key,
            oidc: OidcSettings {
                client_id,
                client_secret,
                endpoints,
            },
            policy,
            registry,
            public_url: self.public_url.filter(|s| !s.trim().is_empty()),
            public_authority: self.public_authority.filter(|s| !s.trim().is_empty()),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
            ws_connect_timeout: Duration::from_secs(self.ws_connect_timeout_secs),
            session_ttl,
        })
    }
}

fn required(name: &'static str, value: String) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingSecret(name));
    }
    Ok(value)
}

/// A TTL must be positive and keep `now + ttl` representable.
fn session_ttl(secs: u64) -> Result<chrono::Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidSessionTtl { secs, reason };
    if secs == 0 {
        return Err(invalid("must be greater than zero"));
    }
    let ttl = i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| invalid("too large"))?;
    if chrono::Utc::now().checked_add_signed(ttl).is_none() {
        return Err(invalid("too large"));
    }
    Ok(ttl)
}
