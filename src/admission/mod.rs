//! Edge admission filter: bearer authentication followed by sliding-window rate limiting.
//!
//! Flow Overview:
//! 1) Strip client-supplied identity headers.
//! 2) Classify the path (public, anonymous, protected).
//! 3) Protected paths: validate the bearer access token, rate limit per user.
//! 4) Anonymous paths: rate limit per client address.
//! 5) Forward with the resolved [`Identity`] as an extension and as headers.

pub mod limiter;
pub mod paths;

use self::limiter::{RateLimitDecision, RateLimitSubject, SlidingWindowLimiter};
use self::paths::{PathClass, PathPolicy};
use crate::api::error::ApiError;
use crate::audit;
use crate::token::{CredentialIssuer, TokenError};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");
pub const USERNAME_HEADER: HeaderName = HeaderName::from_static("x-username");
pub const RATE_LIMIT_REMAINING_HEADER: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");

const UNKNOWN_CLIENT: &str = "unknown";

/// Authenticated caller, attached to requests that passed bearer validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub roles: Vec<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    issuer: CredentialIssuer,
    limiter: SlidingWindowLimiter,
    paths: PathPolicy,
    trust_forwarded: bool,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        issuer: CredentialIssuer,
        limiter: SlidingWindowLimiter,
        paths: PathPolicy,
        trust_forwarded: bool,
    ) -> Self {
        Self {
            issuer,
            limiter,
            paths,
            trust_forwarded,
        }
    }

    #[must_use]
    pub fn trust_forwarded(&self) -> bool {
        self.trust_forwarded
    }

    /// Decide whether a request may proceed. Returns the caller's identity for
    /// protected paths and the rate-limit outcome for limited ones.
    ///
    /// # Errors
    /// Returns the [`ApiError`] to send instead of forwarding the request.
    pub async fn admit(
        &self,
        path: &str,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Result<(Option<Identity>, Option<RateLimitDecision>), ApiError> {
        let (identity, subject) = match self.paths.classify(path) {
            PathClass::Public => return Ok((None, None)),
            PathClass::Anonymous => {
                let client = client_address(headers, peer, self.trust_forwarded);
                (None, RateLimitSubject::Client(client))
            }
            PathClass::Protected => {
                let identity = self.authenticate(headers).await?;
                let subject = RateLimitSubject::User(identity.user_id);
                (Some(identity), subject)
            }
        };

        match self.limiter.check(&subject).await {
            Ok(decision) => Ok((identity, Some(decision))),
            Err(err) => {
                debug!(key = subject.key(), "request rejected by rate limiter: {err}");
                Err(err.into())
            }
        }
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

        match self.issuer.validate_access(token).await {
            Ok(claims) => Ok(Identity {
                user_id: claims.user_id,
                username: claims.sub,
                roles: claims.roles,
            }),
            Err(TokenError::StoreUnavailable(err)) => Err(ApiError::Unavailable(format!(
                "revocation lookup failed: {err}"
            ))),
            Err(err) => {
                warn!(
                    target: audit::TARGET,
                    event = "auth.rejected",
                    token = %audit::fingerprint(token),
                    reason = %err,
                    "bearer token rejected"
                );
                Err(err.into())
            }
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Client address used for anonymous rate limiting and login throttling.
///
/// Forwarding headers are honored only when the deployment sits behind a
/// trusted proxy; otherwise the socket peer address is authoritative.
#[must_use]
pub fn client_address(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
            })
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string())
}

#[must_use]
pub fn peer_address(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// axum middleware wrapping [`AdmissionController::admit`].
pub async fn middleware(
    State(controller): State<Arc<AdmissionController>>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers_mut();
    headers.remove(USER_ID_HEADER);
    headers.remove(USERNAME_HEADER);

    let peer = peer_address(&request);
    let path = request.uri().path().to_string();

    let (identity, decision) = match controller.admit(&path, request.headers(), peer).await {
        Ok(outcome) => outcome,
        Err(err) => return err.into_response(),
    };

    if let Some(identity) = identity {
        let headers = request.headers_mut();
        headers.insert(USER_ID_HEADER, HeaderValue::from(identity.user_id));
        if let Ok(username) = HeaderValue::from_str(&identity.username) {
            headers.insert(USERNAME_HEADER, username);
        }
        request.extensions_mut().insert(identity);
    }

    let mut response = next.run(request).await;
    if let Some(RateLimitDecision::Allowed { remaining }) = decision {
        response
            .headers_mut()
            .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::limiter::{RateLimitConfig, RateLimitFailureMode};
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FailingStore;
    use crate::store::{MemoryStore, RevocationStore};
    use crate::token::TokenConfig;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use secrecy::SecretString;
    use std::time::Duration;
    use tower::ServiceExt;

    const NOW: u64 = 1_750_000_000_000;

    fn controller(
        store: Arc<dyn RevocationStore>,
        limit: u64,
        failure_mode: RateLimitFailureMode,
    ) -> (AdmissionController, CredentialIssuer) {
        let clock = Arc::new(ManualClock::new(NOW));
        let issuer = CredentialIssuer::new(
            TokenConfig::new(SecretString::from(
                "admission-secret-admission-secret".to_string(),
            )),
            Arc::new(MemoryStore::with_clock(clock.clone())),
            clock.clone(),
        )
        .expect("issuer");
        let limiter = SlidingWindowLimiter::new(
            RateLimitConfig {
                limit,
                window: Duration::from_secs(60),
                failure_mode,
            },
            store,
            clock,
        );
        (
            AdmissionController::new(issuer.clone(), limiter, PathPolicy::default(), false),
            issuer,
        )
    }

    fn app(controller: AdmissionController) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/auth/login", get(|| async { "login" }))
            .route(
                "/whoami",
                get(|identity: Identity, headers: HeaderMap| async move {
                    let header = headers
                        .get(USER_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!("{}:{}:{header}", identity.user_id, identity.username)
                }),
            )
            .layer(from_fn_with_state(Arc::new(controller), middleware))
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn memory() -> Arc<dyn RevocationStore> {
        Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(NOW))))
    }

    #[test]
    fn parses_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   xyz"));
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_headers_need_trust() {
        let peer = Some(IpAddr::from([10, 0, 0, 9]));
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));

        assert_eq!(client_address(&headers, peer, false), "10.0.0.9");
        assert_eq!(client_address(&headers, peer, true), "203.0.113.7");

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_address(&headers, peer, true), "10.0.0.9");
        assert_eq!(client_address(&HeaderMap::new(), None, false), "unknown");
    }

    #[tokio::test]
    async fn public_paths_bypass_everything() {
        let (controller, _issuer) = controller(memory(), 0, RateLimitFailureMode::Closed);
        let response = app(controller)
            .oneshot(HttpRequest::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_path_requires_token() {
        let (controller, _issuer) = controller(memory(), 10, RateLimitFailureMode::Closed);
        let response = app(controller)
            .oneshot(HttpRequest::get("/whoami").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(body_string(response).await.contains("\"code\":401"));
    }

    #[tokio::test]
    async fn valid_token_propagates_identity_and_replaces_spoofed_headers() {
        let (controller, issuer) = controller(memory(), 10, RateLimitFailureMode::Closed);
        let token = issuer
            .issue_access_token(7, "alice", &["user".to_string()])
            .expect("token");

        let response = app(controller)
            .oneshot(
                HttpRequest::get("/whoami")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .header("x-user-id", "1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(RATE_LIMIT_REMAINING_HEADER),
            Some(&HeaderValue::from(9_u64))
        );
        assert_eq!(body_string(response).await, "7:alice:7");
    }

    #[tokio::test]
    async fn refresh_token_is_refused_as_bearer() {
        let (controller, issuer) = controller(memory(), 10, RateLimitFailureMode::Closed);
        let pair = issuer.issue_pair(7, "alice", &[]).await.expect("pair");
        let response = app(controller)
            .oneshot(
                HttpRequest::get("/whoami")
                    .header(AUTHORIZATION, format!("Bearer {}", pair.refresh_token))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn anonymous_paths_are_limited_per_client() {
        let (controller, _issuer) = controller(memory(), 2, RateLimitFailureMode::Closed);
        let app = app(controller);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(HttpRequest::get("/auth/login").body(Body::empty()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(HttpRequest::get("/auth/login").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("retry-after"),
            Some(&HeaderValue::from_static("60"))
        );
    }

    #[tokio::test]
    async fn limiter_store_failure_follows_mode() {
        let (closed, _) = controller(
            Arc::new(FailingStore::unavailable()),
            10,
            RateLimitFailureMode::Closed,
        );
        let response = app(closed)
            .oneshot(HttpRequest::get("/auth/login").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let (open, _) = controller(
            Arc::new(FailingStore::unavailable()),
            10,
            RateLimitFailureMode::Open,
        );
        let response = app(open)
            .oneshot(HttpRequest::get("/auth/login").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(RATE_LIMIT_REMAINING_HEADER).is_none());
    }
}
