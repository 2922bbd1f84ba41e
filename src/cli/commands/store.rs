use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("store-url")
                .long("store-url")
                .help("Redis URL for shared state, example: redis://redis:6379/0")
                .long_help(
                    "Redis URL for revocations, sessions, login counters, and rate-limit windows. When unset, state is kept in process memory and is not shared between nodes.",
                )
                .env("WARDEN_STORE_URL"),
        )
        .arg(
            Arg::new("store-timeout-ms")
                .long("store-timeout-ms")
                .help("Per-operation store timeout in milliseconds")
                .default_value("500")
                .env("WARDEN_STORE_TIMEOUT_MS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
