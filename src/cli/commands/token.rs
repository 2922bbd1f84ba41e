use crate::token::MIN_SECRET_BYTES;
use clap::{builder::ValueParser, Arg, Command};

pub fn validator_secret() -> ValueParser {
    ValueParser::from(move |secret: &str| -> std::result::Result<String, String> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(format!("secret must be at least {MIN_SECRET_BYTES} bytes"));
        }
        Ok(secret.to_string())
    })
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("token-secret")
                .long("token-secret")
                .help("HMAC-SHA256 signing secret, shared by every node")
                .env("WARDEN_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true)
                .value_parser(validator_secret()),
        )
        .arg(
            Arg::new("access-ttl-seconds")
                .long("access-ttl-seconds")
                .help("Access token lifetime in seconds")
                .default_value("86400")
                .env("WARDEN_ACCESS_TTL_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("refresh-ttl-seconds")
                .long("refresh-ttl-seconds")
                .help("Refresh token lifetime in seconds")
                .default_value("604800")
                .env("WARDEN_REFRESH_TTL_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
