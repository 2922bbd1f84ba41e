use crate::admission::limiter::RateLimitFailureMode;
use clap::{builder::ValueParser, Arg, ArgAction, Command};

pub fn validator_failure_mode() -> ValueParser {
    ValueParser::from(
        move |mode: &str| -> std::result::Result<RateLimitFailureMode, String> { mode.parse() },
    )
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("rate-limit")
                .long("rate-limit")
                .help("Requests admitted per subject within the window")
                .default_value("100")
                .env("WARDEN_RATE_LIMIT")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-window-seconds")
                .long("rate-window-seconds")
                .help("Sliding window length in seconds")
                .default_value("60")
                .env("WARDEN_RATE_WINDOW_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("rate-limit-failure-mode")
                .long("rate-limit-failure-mode")
                .help("Behavior when the store is unreachable: closed (reject) or open (admit)")
                .default_value("closed")
                .env("WARDEN_RATE_LIMIT_FAILURE_MODE")
                .value_parser(validator_failure_mode()),
        )
        .arg(
            Arg::new("trust-forwarded")
                .long("trust-forwarded")
                .help("Take the client address from X-Forwarded-For / X-Real-IP")
                .env("WARDEN_TRUST_FORWARDED")
                .action(ArgAction::SetTrue),
        )
}
