mod guard;
mod limit;
mod logging;
mod snowflake;
mod store;
mod token;

pub use self::logging::validator_log_level;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("warden")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("WARDEN_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("directory-url")
                .long("directory-url")
                .help("User directory base URL, example: http://users:8081")
                .env("WARDEN_DIRECTORY_URL")
                .required(true)
                .value_parser(clap::value_parser!(url::Url)),
        );

    let command = store::with_args(command);
    let command = snowflake::with_args(command);
    let command = token::with_args(command);
    let command = guard::with_args(command);
    let command = limit::with_args(command);
    logging::with_args(command)
}
