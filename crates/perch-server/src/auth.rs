//! Bearer-token sessions and the `/auth` endpoints.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::http::{ApiError, AppState};

/// How long a login lasts.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Session {
    username: String,
    expires_at: Instant,
}

/// Why a request failed authentication. The dispatcher maps every variant
/// to 401.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or invalid bearer token format")]
    MalformedHeader,

    #[error("token expired")]
    Expired,

    #[error("token not found")]
    Unknown,
}

/// Issues, validates and revokes session tokens.
#[derive(Default)]
pub struct Authenticator {
    sessions: DashMap<String, Session>,
}

impl Authenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-install username→token pairs (the `-t` token file). Each gets a
    /// full session lifetime from now.
    pub fn install_users(&self, users: HashMap<String, String>) {
        for (username, token) in users {
            self.sessions.insert(
                token,
                Session {
                    username,
                    expires_at: Instant::now() + SESSION_TTL,
                },
            );
        }
    }

    /// Start a session for `username` and return its token.
    pub fn login(&self, username: &str) -> String {
        let token = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        info!(username, "login");
        token
    }

    pub fn logout(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Check the `Authorization: Bearer <token>` header and return the
    /// session's username.
    pub fn validate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let raw = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let mut parts = raw.splitn(2, ' ');
        let scheme = parts.next().unwrap_or("");
        let token = parts.next().unwrap_or("");
        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(AuthError::MalformedHeader);
        }

        let Some(session) = self.sessions.get(token) else {
            return Err(AuthError::Unknown);
        };
        if session.expires_at <= Instant::now() {
            return Err(AuthError::Expired);
        }
        Ok(session.username.clone())
    }

    fn token_of(headers: &HeaderMap) -> Option<String> {
        let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        raw.splitn(2, ' ').nth(1).map(str::to_string)
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Unauthorized(e.to_string())
    }
}

/// `POST /auth` — log in and receive a token.
pub async fn login(State(st): State<AppState>, body: Bytes) -> Response {
    let Ok(credentials) = serde_json::from_slice::<HashMap<String, String>>(&body) else {
        return ApiError::BadRequest("error unmarshalling request body".to_string()).into_response();
    };
    let username = credentials
        .get("username")
        .map(String::as_str)
        .unwrap_or("");
    if username.is_empty() {
        return ApiError::BadRequest("missing username".to_string()).into_response();
    }

    let token = st.auth.login(username);
    (StatusCode::OK, Json(json!({ "token": token }))).into_response()
}

/// `DELETE /auth` — invalidate the presented token.
pub async fn logout(State(st): State<AppState>, headers: HeaderMap) -> Response {
    match st.auth.validate(&headers) {
        Ok(_) => {
            if let Some(token) = Authenticator::token_of(&headers) {
                st.auth.logout(&token);
                info!("logout");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn login_then_validate_round_trips() {
        let auth = Authenticator::new();
        let token = auth.login("alice");
        assert_eq!(auth.validate(&bearer(&token)), Ok("alice".to_string()));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let auth = Authenticator::new();
        assert_eq!(
            auth.validate(&HeaderMap::new()),
            Err(AuthError::MalformedHeader)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        assert_eq!(auth.validate(&headers), Err(AuthError::MalformedHeader));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(auth.validate(&headers), Err(AuthError::MalformedHeader));
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let auth = Authenticator::new();
        assert_eq!(
            auth.validate(&bearer("not-a-token")),
            Err(AuthError::Unknown)
        );
    }

    #[test]
    fn logout_revokes_the_token() {
        let auth = Authenticator::new();
        let token = auth.login("alice");
        auth.logout(&token);
        assert_eq!(auth.validate(&bearer(&token)), Err(AuthError::Unknown));
    }

    #[test]
    fn installed_users_can_authenticate() {
        let auth = Authenticator::new();
        auth.install_users(HashMap::from([(
            "bob".to_string(),
            "preset-token".to_string(),
        )]));
        assert_eq!(
            auth.validate(&bearer("preset-token")),
            Ok("bob".to_string())
        );
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let auth = Authenticator::new();
        let token = auth.login("alice");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("bearer {token}")).unwrap(),
        );
        assert_eq!(auth.validate(&headers), Ok("alice".to_string()));
    }
}
