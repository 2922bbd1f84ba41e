use crate::snowflake::{MAX_DATACENTER_ID, MAX_MACHINE_ID};
use clap::{Arg, Command};

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("datacenter-id")
                .long("datacenter-id")
                .help("Datacenter id (0-31), derived from the host address when unset")
                .env("WARDEN_DATACENTER_ID")
                .value_parser(clap::value_parser!(i64).range(0..=MAX_DATACENTER_ID)),
        )
        .arg(
            Arg::new("machine-id")
                .long("machine-id")
                .help("Machine id (0-31), derived from the host address when unset")
                .env("WARDEN_MACHINE_ID")
                .value_parser(clap::value_parser!(i64).range(0..=MAX_MACHINE_ID)),
        )
}
