//! End-to-end tests for the HTTP surface.
//!
//! Each test assembles the full router over an in-process store, a static
//! user directory and a manual clock, then drives it with `oneshot` calls:
//! 1. Login, identity lookup, refresh rotation and logout.
//! 2. Concurrent refresh of the same token.
//! 3. Login lockout after repeated failures.
//! 4. Sliding-window rate limiting on anonymous paths.
//! 5. Health and id endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::connect_info::MockConnectInfo,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use secrecy::SecretString;
use serde_json::{json, Value};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tower::ServiceExt;
use warden::{
    admission::{
        limiter::{RateLimitConfig, SlidingWindowLimiter},
        paths::PathPolicy,
        AdmissionController, RATE_LIMIT_REMAINING_HEADER,
    },
    api::{self, AppState},
    clock::{Clock, ManualClock},
    directory::{DirectoryUser, StaticDirectory},
    guard::{GuardConfig, LoginGuard},
    snowflake::{self, IdAllocator},
    store::{MemoryStore, RevocationStore, StoreError, WindowDecision},
    token::{CredentialIssuer, TokenConfig},
};

const SECRET: &str = "integration-secret-with-at-least-32-bytes";
const NOW: u64 = 1_760_000_000_000;

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
}

struct Limits {
    rate_limit: u64,
    max_attempts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            max_attempts: 5,
        }
    }
}

fn harness(limits: &Limits) -> Result<Harness> {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    harness_over(limits, store, clock)
}

fn harness_over(
    limits: &Limits,
    store: Arc<dyn RevocationStore>,
    clock: Arc<ManualClock>,
) -> Result<Harness> {
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let issuer = CredentialIssuer::new(
        TokenConfig::new(SecretString::from(SECRET.to_string())),
        store.clone(),
        dyn_clock.clone(),
    )?;

    let guard = LoginGuard::new(
        GuardConfig {
            max_attempts: limits.max_attempts,
            lockout: Duration::from_secs(600),
        },
        store.clone(),
    );

    let limiter = SlidingWindowLimiter::new(
        RateLimitConfig {
            limit: limits.rate_limit,
            ..RateLimitConfig::default()
        },
        store.clone(),
        dyn_clock.clone(),
    );

    let admission = Arc::new(AdmissionController::new(
        issuer.clone(),
        limiter,
        PathPolicy::default(),
        false,
    ));

    let directory = StaticDirectory::new().with_user(
        DirectoryUser {
            user_id: 42,
            username: "alice".to_string(),
            roles: vec!["admin".to_string()],
        },
        "correct horse",
    );

    let state = Arc::new(AppState {
        issuer,
        guard,
        ids: Arc::new(IdAllocator::with_clock(1, 2, dyn_clock)?),
        directory: Arc::new(directory),
        store,
        admission,
    });

    let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 40_000);
    let app = api::router(state).layer(MockConnectInfo(peer));

    Ok(Harness { app, clock })
}

fn post_json(uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

fn with_bearer(method: &str, uri: &str, token: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())?)
}

fn get(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

async fn json_body(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn login(app: &Router, password: &str) -> Result<Response> {
    Ok(app
        .clone()
        .oneshot(post_json(
            "/auth/login",
            &json!({"username": "alice", "password": password}),
        )?)
        .await?)
}

fn field<'a>(body: &'a Value, name: &str) -> Result<&'a str> {
    body[name]
        .as_str()
        .with_context(|| format!("missing string field {name}"))
}

#[tokio::test]
async fn login_refresh_logout_flow() -> Result<()> {
    let Harness { app, clock } = harness(&Limits::default())?;

    let response = login(&app, "correct horse").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let tokens = json_body(response).await?;
    assert_eq!(tokens["userId"], 42);
    assert_eq!(tokens["username"], "alice");
    assert_eq!(tokens["tokenType"], "Bearer");
    assert_eq!(tokens["expiresIn"], 86_400);
    let access = field(&tokens, "accessToken")?.to_string();
    let refresh = field(&tokens, "refreshToken")?.to_string();

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/auth/me", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(RATE_LIMIT_REMAINING_HEADER).is_some());
    let me = json_body(response).await?;
    assert_eq!(me, json!({"userId": 42, "username": "alice", "roles": ["admin"]}));

    // Refresh tokens are not accepted as bearer credentials.
    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/auth/me", &refresh)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    clock.advance(1_000);
    let response = app
        .clone()
        .oneshot(post_json("/auth/refresh", &json!({"refreshToken": refresh}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json_body(response).await?;
    let new_access = field(&rotated, "accessToken")?.to_string();
    let new_refresh = field(&rotated, "refreshToken")?.to_string();
    assert_ne!(new_access, access);
    assert_ne!(new_refresh, refresh);

    // The old refresh token is single use.
    let response = app
        .clone()
        .oneshot(post_json("/auth/refresh", &json!({"refreshToken": refresh}))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/auth/me", &new_access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let mut logout = post_json("/auth/logout", &json!({"refreshToken": new_refresh}))?;
    logout.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {new_access}").parse()?,
    );
    let response = app.clone().oneshot(logout).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/auth/me", &new_access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_some());

    let response = app
        .clone()
        .oneshot(with_bearer("POST", "/auth/refresh", &new_refresh)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn expired_access_token_is_rejected() -> Result<()> {
    let Harness { app, clock } = harness(&Limits::default())?;

    let tokens = json_body(login(&app, "correct horse").await?).await?;
    let access = field(&tokens, "accessToken")?.to_string();

    clock.advance(86_401_000);
    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/auth/me", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await?;
    assert_eq!(body["code"], 401);
    Ok(())
}

#[tokio::test]
async fn concurrent_refresh_has_one_winner() -> Result<()> {
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(InterleavedStore::new(Arc::new(MemoryStore::with_clock(
        clock.clone(),
    ))));
    let Harness { app, .. } = harness_over(&Limits::default(), store.clone(), clock)?;

    let tokens = json_body(login(&app, "correct horse").await?).await?;
    let refresh = field(&tokens, "refreshToken")?.to_string();
    let mark = store.ops().len();

    let first = app.clone().oneshot(with_bearer("POST", "/auth/refresh", &refresh)?);
    let second = app.clone().oneshot(with_bearer("POST", "/auth/refresh", &refresh)?);
    let (first, second) = tokio::join!(first, second);

    let mut statuses = [first?.status(), second?.status()];
    statuses.sort_by_key(StatusCode::as_u16);
    assert_eq!(statuses, [StatusCode::OK, StatusCode::UNAUTHORIZED]);

    // Both requests passed the revocation check before either took the session.
    let ops = store.ops();
    let first_take = ops[mark..]
        .iter()
        .position(|op| *op == "getdel")
        .context("no session lookup recorded")?;
    let checks = ops[mark..mark + first_take]
        .iter()
        .filter(|op| **op == "exists")
        .count();
    assert_eq!(checks, 2);
    Ok(())
}

#[tokio::test]
async fn repeated_failures_lock_the_login() -> Result<()> {
    let Harness { app, clock } = harness(&Limits {
        max_attempts: 3,
        ..Limits::default()
    })?;

    for _ in 0..2 {
        let response = login(&app, "wrong").await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = login(&app, "wrong").await?;
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert_eq!(
        response.headers().get(header::RETRY_AFTER).map(|v| v.as_bytes()),
        Some(&b"600"[..])
    );

    // Correct credentials do not bypass an active lockout.
    let response = login(&app, "correct horse").await?;
    assert_eq!(response.status(), StatusCode::LOCKED);

    clock.advance(601_000);
    let response = login(&app, "correct horse").await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn anonymous_requests_are_rate_limited() -> Result<()> {
    let Harness { app, clock } = harness(&Limits {
        rate_limit: 2,
        ..Limits::default()
    })?;

    for _ in 0..2 {
        let response = login(&app, "wrong").await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = login(&app, "correct horse").await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    let body = json_body(response).await?;
    assert_eq!(body["code"], 429);

    // Public paths are never limited.
    let response = app.clone().oneshot(get("/health")?).await?;
    assert_eq!(response.status(), StatusCode::OK);

    clock.advance(61_000);
    let response = login(&app, "correct horse").await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn spoofed_identity_headers_are_replaced() -> Result<()> {
    let Harness { app, .. } = harness(&Limits::default())?;

    let mut request = get("/auth/me")?;
    request
        .headers_mut()
        .insert("x-user-id", "1".parse()?);
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn health_reports_store() -> Result<()> {
    let Harness { app, .. } = harness(&Limits::default())?;

    let response = app.clone().oneshot(get("/health")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-app").is_some());
    assert!(response.headers().get("x-request-id").is_some());
    let body = json_body(response).await?;
    assert_eq!(body["store"], "ok");
    assert_eq!(body["store_backend"], "memory");
    assert_eq!(body["name"], "warden");
    Ok(())
}

#[tokio::test]
async fn id_endpoints_require_a_token() -> Result<()> {
    let Harness { app, .. } = harness(&Limits::default())?;

    let response = app.clone().oneshot(get("/id/generate")?).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE),
        Some(&header::HeaderValue::from_static("Bearer"))
    );

    let tokens = json_body(login(&app, "correct horse").await?).await?;
    let access = field(&tokens, "accessToken")?.to_string();

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/generate", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    let id = body["id"].as_i64().context("id is not an integer")?;
    assert_eq!(field(&body, "idStr")?, id.to_string());

    let parts = snowflake::parse(id.unsigned_abs());
    assert_eq!(parts.datacenter_id, 1);
    assert_eq!(parts.machine_id, 2);
    assert_eq!(parts.timestamp, NOW);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", &format!("/id/parse/{id}"), &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await?;
    assert_eq!(parsed["datacenterId"], 1);
    assert_eq!(parsed["machineId"], 2);
    assert_eq!(parsed["timestamp"], NOW);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/parse/-5", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/generate/batch?count=5", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let batch = json_body(response).await?;
    assert_eq!(batch["count"], 5);
    let ids: Vec<i64> = serde_json::from_value(batch["ids"].clone())?;
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(ids[0] > id);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/generate/batch?count=101", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/generate/batch?count=abc", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await?["code"], 400);

    let mut parse_batch = post_json("/id/parse/batch", &json!([id, -1]))?;
    parse_batch
        .headers_mut()
        .insert(header::AUTHORIZATION, format!("Bearer {access}").parse()?);
    let response = app.clone().oneshot(parse_batch).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await?;
    assert_eq!(parsed["totalCount"], 2);
    assert_eq!(parsed["successCount"], 1);
    assert_eq!(parsed["results"][0]["machineId"], 2);
    assert_eq!(parsed["errors"][0]["id"], -1);

    let response = app
        .clone()
        .oneshot(with_bearer("GET", "/id/info", &access)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let info = json_body(response).await?;
    assert_eq!(info["datacenterId"], 1);
    assert_eq!(info["machineId"], 2);
    Ok(())
}

/// Yields before every store call so requests joined on one thread interleave
/// at each round-trip.
#[derive(Debug)]
struct InterleavedStore {
    inner: Arc<dyn RevocationStore>,
    ops: Mutex<Vec<&'static str>>,
}

impl InterleavedStore {
    fn new(inner: Arc<dyn RevocationStore>) -> Self {
        Self {
            inner,
            ops: Mutex::new(Vec::new()),
        }
    }

    fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn enter(&self, op: &'static str) {
        self.ops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl RevocationStore for InterleavedStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.enter("set").await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter("get").await;
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("exists").await;
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.enter("delete").await;
        self.inner.delete(key).await
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.enter("getdel").await;
        self.inner.get_and_delete(key).await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        self.enter("incr").await;
        self.inner.increment_with_ttl(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.enter("ttl").await;
        self.inner.ttl(key).await
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        limit: u64,
    ) -> Result<WindowDecision, StoreError> {
        self.enter("window").await;
        self.inner
            .admit_sliding_window(key, now_ms, window, limit)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.enter("ping").await;
        self.inner.ping().await
    }
}
