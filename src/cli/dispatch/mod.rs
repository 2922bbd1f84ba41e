use crate::admission::limiter::RateLimitFailureMode;
use crate::cli::actions::{server::Args, Action};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

fn seconds(matches: &clap::ArgMatches, id: &str, default: u64) -> Duration {
    Duration::from_secs(matches.get_one::<u64>(id).copied().unwrap_or(default))
}

/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);

    let directory_url = matches
        .get_one::<Url>("directory-url")
        .cloned()
        .context("missing required argument: --directory-url")?;

    let token_secret = matches
        .get_one::<String>("token-secret")
        .cloned()
        .map(SecretString::from)
        .context("missing required argument: --token-secret")?;

    Ok(Action::Server(Args {
        port,
        store_url: matches.get_one::<String>("store-url").cloned(),
        store_timeout: Duration::from_millis(
            matches
                .get_one::<u64>("store-timeout-ms")
                .copied()
                .unwrap_or(500),
        ),
        datacenter_id: matches.get_one::<i64>("datacenter-id").copied(),
        machine_id: matches.get_one::<i64>("machine-id").copied(),
        token_secret,
        access_ttl: seconds(matches, "access-ttl-seconds", 86_400),
        refresh_ttl: seconds(matches, "refresh-ttl-seconds", 604_800),
        login_max_attempts: matches
            .get_one::<u32>("login-max-attempts")
            .copied()
            .unwrap_or(5),
        lockout: seconds(matches, "lockout-seconds", 1_800),
        rate_limit: matches.get_one::<u64>("rate-limit").copied().unwrap_or(100),
        rate_window: seconds(matches, "rate-window-seconds", 60),
        rate_limit_failure_mode: matches
            .get_one::<RateLimitFailureMode>("rate-limit-failure-mode")
            .copied()
            .unwrap_or_default(),
        trust_forwarded: matches.get_flag("trust-forwarded"),
        directory_url,
    }))
}
