use crate::{
    admission::{
        limiter::{RateLimitConfig, RateLimitFailureMode, SlidingWindowLimiter},
        paths::PathPolicy,
        AdmissionController,
    },
    api::{self, AppState},
    cli::telemetry,
    clock::{Clock, SystemClock},
    directory::RemoteDirectory,
    guard::{GuardConfig, LoginGuard},
    snowflake::{node, IdAllocator},
    store::{MemoryStore, RedisStore, RevocationStore},
    token::{CredentialIssuer, TokenConfig},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub store_url: Option<String>,
    pub store_timeout: Duration,
    pub datacenter_id: Option<i64>,
    pub machine_id: Option<i64>,
    pub token_secret: SecretString,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub login_max_attempts: u32,
    pub lockout: Duration,
    pub rate_limit: u64,
    pub rate_window: Duration,
    pub rate_limit_failure_mode: RateLimitFailureMode,
    pub trust_forwarded: bool,
    pub directory_url: Url,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store cannot be reached, configuration is invalid, or the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = connect_store(&args, &clock).await?;

    let (datacenter_id, machine_id) = node::resolve(args.datacenter_id, args.machine_id);
    let ids = Arc::new(
        IdAllocator::with_clock(datacenter_id, machine_id, clock.clone())
            .context("Invalid id allocator configuration")?,
    );

    let issuer = CredentialIssuer::new(
        TokenConfig {
            secret: args.token_secret,
            access_ttl: args.access_ttl,
            refresh_ttl: args.refresh_ttl,
        },
        store.clone(),
        clock.clone(),
    )
    .context("Invalid token configuration")?;

    let guard = LoginGuard::new(
        GuardConfig {
            max_attempts: args.login_max_attempts,
            lockout: args.lockout,
        },
        store.clone(),
    );

    let limiter = SlidingWindowLimiter::new(
        RateLimitConfig {
            limit: args.rate_limit,
            window: args.rate_window,
            failure_mode: args.rate_limit_failure_mode,
        },
        store.clone(),
        clock,
    );

    let admission = Arc::new(AdmissionController::new(
        issuer.clone(),
        limiter,
        PathPolicy::default(),
        args.trust_forwarded,
    ));

    let directory = RemoteDirectory::new(&args.directory_url, DIRECTORY_TIMEOUT)
        .context("Failed to build directory client")?;

    let state = Arc::new(AppState {
        issuer,
        guard,
        ids,
        directory: Arc::new(directory),
        store,
        admission,
    });

    let result = api::serve(args.port, state).await;

    telemetry::shutdown_tracer();

    result
}

async fn connect_store(args: &Args, clock: &Arc<dyn Clock>) -> Result<Arc<dyn RevocationStore>> {
    if let Some(url) = &args.store_url {
        let store = RedisStore::connect(url, args.store_timeout)
            .await
            .context("Failed to connect to store")?;
        return Ok(Arc::new(store));
    }

    warn!("No store url configured, using in-process state (not shared between nodes)");
    let store = MemoryStore::with_clock(clock.clone());
    store.spawn_sweeper(SWEEP_INTERVAL);
    Ok(Arc::new(store))
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "store",
            args.store_url
                .as_deref()
                .map_or_else(|| "memory".to_string(), redact_url),
        ),
        ("store_timeout_ms", args.store_timeout.as_millis().to_string()),
        (
            "node_ids",
            format!(
                "{}/{}",
                args.datacenter_id
                    .map_or_else(|| "auto".to_string(), |id| id.to_string()),
                args.machine_id
                    .map_or_else(|| "auto".to_string(), |id| id.to_string())
            ),
        ),
        ("access_ttl_s", args.access_ttl.as_secs().to_string()),
        ("refresh_ttl_s", args.refresh_ttl.as_secs().to_string()),
        (
            "login_lockout",
            format!(
                "{} attempts / {}s",
                args.login_max_attempts,
                args.lockout.as_secs()
            ),
        ),
        (
            "rate_limit",
            format!(
                "{} / {}s ({})",
                args.rate_limit,
                args.rate_window.as_secs(),
                args.rate_limit_failure_mode
            ),
        ),
        ("trust_forwarded", args.trust_forwarded.to_string()),
        ("directory", redact_url(args.directory_url.as_str())),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-url".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} - {} - {}\n\n{title}:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    if trimmed.len() > 7 {
        trimmed[..7].to_string()
    } else {
        trimmed.to_string()
    }
}
