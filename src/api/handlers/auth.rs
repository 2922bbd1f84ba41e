//! Login, token refresh, logout, and identity endpoints.
//!
//! Flow Overview:
//! 1) Login checks the lockout counter for `(username, client)` before asking the directory.
//! 2) Failures increment the counter; a success clears it and issues a token pair.
//! 3) Refresh rotates a refresh token (header or body); only one concurrent caller wins.
//! 4) Logout revokes the bearer token and the session it belongs to.

use crate::admission::{self, Identity};
use crate::api::{error::ApiError, AppState};
use crate::audit;
use crate::token::TokenPair;
use axum::{
    extract::{ConnectInfo, Extension},
    http::HeaderMap,
    response::Json,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: pair.expires_in,
            refresh_expires_in: pair.refresh_expires_in,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenResponse,
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

pub async fn login(
    state: Extension<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = request.username.trim();
    if username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let client = admission::client_address(&headers, peer, state.admission.trust_forwarded());

    state.guard.check_allowed(username, &client).await?;

    let password = SecretString::from(request.password);
    let user = match state.directory.verify(username, &password).await {
        Ok(user) => user,
        Err(err) => {
            error!("Directory verification failed: {err}");
            return Err(ApiError::Unavailable(err.to_string()));
        }
    };

    let Some(user) = user else {
        let attempts = state.guard.record_failure(username, &client).await?;
        warn!(
            target: audit::TARGET,
            event = "login.failed",
            username,
            client = %client,
            attempts,
            "login failed"
        );

        let config = state.guard.config();
        if attempts >= i64::from(config.max_attempts) {
            return Err(ApiError::Locked {
                retry_after: config.lockout,
            });
        }
        return Err(ApiError::Unauthorized(
            "invalid username or password".to_string(),
        ));
    };

    state.guard.record_success(username, &client).await?;

    let pair = state
        .issuer
        .issue_pair(user.user_id, &user.username, &user.roles)
        .await?;

    info!(
        target: audit::TARGET,
        event = "login.succeeded",
        user_id = user.user_id,
        client = %client,
        "login succeeded"
    );

    Ok(Json(LoginResponse {
        tokens: pair.into(),
        user_id: user.user_id,
        username: user.username,
    }))
}

pub async fn refresh(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<TokenResponse>, ApiError> {
    let from_body = body.and_then(|Json(request)| request.refresh_token);
    let token = admission::bearer_token(&headers)
        .map(str::to_string)
        .or(from_body)
        .ok_or_else(|| ApiError::BadRequest("refresh token is required".to_string()))?;

    let pair = state.issuer.refresh(&token).await?;

    Ok(Json(pair.into()))
}

pub async fn logout(
    state: Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let token = admission::bearer_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    state.issuer.logout(token).await?;

    if let Some(refresh_token) = body.and_then(|Json(request)| request.refresh_token) {
        state.issuer.logout(&refresh_token).await?;
    }

    Ok(Json(MessageResponse {
        message: "logged out".to_string(),
    }))
}

pub async fn me(identity: Identity) -> Json<Identity> {
    Json(identity)
}
