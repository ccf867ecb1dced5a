//! Login handshake with an external OpenID Connect provider.
//!
//! The gateway never sees passwords. `/login` sends the browser to the
//! provider, `/auth/callback` exchanges the returned code for the user's
//! email, and a session is created only if the access policy allows it.

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use reqwest::Url;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthError, ConfigError};
use crate::session::Principal;
use crate::state::{request_host, AppState};

/// Cookie holding the signed CSRF `state` for an in-flight login.
pub const LOGIN_STATE_COOKIE: &str = "sso_login_state";

pub const GOOGLE_AUTHORIZATION_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const SCOPES: &str = "openid email profile";

/// Identity returned by the provider after a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub email: String,
    pub name: Option<String>,
}

/// The external identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// URL the browser is redirected to in order to sign in.
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Trades an authorization code for the signed-in user's identity.
    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<UserInfo, AuthError>;
}

/// Provider endpoint set.
#[derive(Debug, Clone)]
pub struct OidcEndpoints {
    pub authorization: Url,
    pub token: Url,
    pub userinfo: Url,
}

impl OidcEndpoints {
    pub fn parse(authorization: &str, token: &str, userinfo: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            authorization: parse_url(authorization)?,
            token: parse_url(token)?,
            userinfo: parse_url(userinfo)?,
        })
    }

    pub fn google() -> Result<Self, ConfigError> {
        Self::parse(GOOGLE_AUTHORIZATION_URL, GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL)
    }
}

fn parse_url(url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|e| ConfigError::InvalidProviderUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Authorization-code flow against an OpenID Connect provider.
#[derive(Debug, Clone)]
pub struct OidcProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoints: OidcEndpoints,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
    #[serde(default)]
    name: Option<String>,
}

impl OidcProvider {
    pub fn new(
        client: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        endpoints: OidcEndpoints,
    ) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            endpoints,
        }
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = self.endpoints.authorization.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        url.into()
    }

    async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<UserInfo, AuthError> {
        let resp = self
            .client
            .post(self.endpoints.token.clone())
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Rejected(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let token: TokenResponse = resp.json().await?;

        let resp = self
            .client
            .get(self.endpoints.userinfo.clone())
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AuthError::Rejected(format!(
                "userinfo endpoint returned {}",
                resp.status()
            )));
        }
        let info: UserInfoResponse = resp.json().await?;

        if info.email_verified == Some(false) {
            return Err(AuthError::Rejected("email not verified".to_string()));
        }

        Ok(UserInfo {
            email: info.email.unwrap_or_default(),
            name: info.name,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// `GET /login`
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    if let Some(error) = query.error {
        return (
            StatusCode::FORBIDDEN,
            Html(format!(
                "<!doctype html><html><head><title>Access denied</title></head><body>\
                 <h1>Access denied</h1><p>{}</p><p><a href=\"/login\">Try another account</a></p>\
                 </body></html>",
                if error == "unauthorized" {
                    "Your account is not allowed to use this gateway."
                } else {
                    "Sign-in failed."
                }
            )),
        )
            .into_response();
    }

    let nonce = Uuid::new_v4().simple().to_string();
    let redirect_uri = callback_url(&state, &headers);
    let target = state.provider.authorize_url(&redirect_uri, &nonce);

    let cookie = Cookie::build((LOGIN_STATE_COOKIE, state.gate.signer().sign(&nonce)))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();

    (jar.add(cookie), Redirect::to(&target)).into_response()
}

/// `GET /auth/callback`
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    let expected = jar
        .get(LOGIN_STATE_COOKIE)
        .and_then(|c| state.gate.signer().verify(c.value()));
    let jar = jar.remove(Cookie::build(LOGIN_STATE_COOKIE).path("/"));

    match (expected, query.state) {
        (Some(expected), Some(got)) if expected == got => {}
        _ => return Err(AuthError::StateMismatch),
    }
    let code = query.code.filter(|c| !c.is_empty()).ok_or(AuthError::MissingCode)?;

    let redirect_uri = callback_url(&state, &headers);
    let info = state.provider.exchange(&code, &redirect_uri).await?;

    let principal = Principal::new(&info.email, info.name.as_deref())
        .filter(|p| state.gate.policy().is_allowed(p.email()));
    let Some(principal) = principal else {
        warn!(email = %info.email, "login rejected by access policy");
        return Ok((jar, Redirect::to("/login?error=unauthorized")).into_response());
    };

    info!(email = %principal.email(), "user logged in");
    let jar = state.gate.login(jar, principal);
    Ok((jar, Redirect::to("/")).into_response())
}

/// `GET /logout`
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    let jar = state.gate.logout(jar);
    (jar, Redirect::to("/login")).into_response()
}

fn callback_url(state: &AppState, headers: &HeaderMap) -> String {
    format!("{}/auth/callback", state.public_base_url(request_host(headers)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Provider that accepts one fixed code and returns a fixed identity.
    #[derive(Debug, Default)]
    pub(crate) struct StubProvider {
        pub identity: Option<UserInfo>,
        pub seen_redirects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl IdentityProvider for StubProvider {
        fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
            format!("https://idp.test/authorize?redirect_uri={redirect_uri}&state={state}")
        }

        async fn exchange(&self, code: &str, redirect_uri: &str) -> Result<UserInfo, AuthError> {
            if let Ok(mut seen) = self.seen_redirects.lock() {
                seen.push(redirect_uri.to_string());
            }
            match (&self.identity, code) {
                (Some(info), "good-code") => Ok(info.clone()),
                _ => Err(AuthError::Rejected("bad code".to_string())),
            }
        }
    }

    #[test]
    fn test_authorize_url_carries_oauth_params() {
        let provider = OidcProvider::new(
            reqwest::Client::new(),
            "client-123",
            "shh",
            OidcEndpoints::google().unwrap(),
        );
        let url =
            Url::parse(&provider.authorize_url("http://gw:8000/auth/callback", "n1")).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("accounts.google.com"));
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-123");
        assert_eq!(pairs["redirect_uri"], "http://gw:8000/auth/callback");
        assert_eq!(pairs["scope"], "openid email profile");
        assert_eq!(pairs["state"], "n1");
        assert!(!pairs.contains_key("client_secret"));
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        assert!(matches!(
            OidcEndpoints::parse("not a url", GOOGLE_TOKEN_URL, GOOGLE_USERINFO_URL),
            Err(ConfigError::InvalidProviderUrl { .. })
        ));
    }
}
