use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("login-max-attempts")
                .long("login-max-attempts")
                .help("Failed logins per username and client before lockout")
                .default_value("5")
                .env("WARDEN_LOGIN_MAX_ATTEMPTS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("lockout-seconds")
                .long("lockout-seconds")
                .help("Lockout window in seconds, restarted by every failure")
                .default_value("1800")
                .env("WARDEN_LOCKOUT_SECONDS")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
