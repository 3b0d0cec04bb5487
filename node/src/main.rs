//! Drive message buffer pools from concurrent workers under a liveness watchdog.

use bufq_pool::{DynamicConfig, FixedConfig};
use bufq_watchdog::Config as WatchdogConfig;
use clap::{value_parser, Arg, Command};
use node::{run, Config, Error};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{num::NonZeroUsize, time::Duration};
use tracing::{error, Level};

fn main() {
    let matches = command().get_matches();

    // Initialize logging
    let level = *matches.get_one::<Level>("log-level").unwrap();
    tracing_subscriber::fmt().with_max_level(level).init();

    let cfg = match parse_config(&matches) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(?err, "invalid configuration");
            std::process::exit(2);
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build runtime");
    let mut registry = Registry::default();
    match runtime.block_on(run(cfg, &mut registry)) {
        Ok(report) => {
            println!("{report:?}");
            let mut buffer = String::new();
            encode(&mut buffer, &registry).expect("failed to encode metrics");
            print!("{buffer}");
        }
        Err(err) => {
            error!(?err, "run failed");
            std::process::exit(1);
        }
    }
}

/// Command line interface.
fn command() -> Command {
    Command::new("bufq-node")
        .about("Drive message buffer pools from concurrent workers under a liveness watchdog")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("classes")
                .long("classes")
                .value_delimiter(',')
                .value_parser(value_parser!(usize))
                .default_values(["4", "8", "16", "32"])
                .help("Size classes of the size-classed pool (a 0 ends the ladder)"),
        )
        .arg(
            Arg::new("item-size")
                .long("item-size")
                .value_parser(value_parser!(usize))
                .default_value("64")
                .help("Size of each fixed pool slot in bytes"),
        )
        .arg(
            Arg::new("items")
                .long("items")
                .value_parser(value_parser!(usize))
                .default_value("4")
                .help("Number of fixed pool slots"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(usize))
                .default_value("8")
                .help("Number of concurrent workers"),
        )
        .arg(
            Arg::new("messages")
                .long("messages")
                .value_parser(value_parser!(usize))
                .default_value("1000")
                .help("Messages processed by each worker"),
        )
        .arg(
            Arg::new("watchdog-ms")
                .long("watchdog-ms")
                .value_parser(value_parser!(u64))
                .default_value("1000")
                .help("Watchdog period in milliseconds"),
        )
        .arg(
            Arg::new("reset-ms")
                .long("reset-ms")
                .value_parser(value_parser!(u64))
                .default_value("250")
                .help("Automatic watchdog reset period in milliseconds"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_parser(value_parser!(Level))
                .default_value("info")
                .help("Log level (trace, debug, info, warn, error)"),
        )
}

/// Build a [Config] from parsed command line arguments.
fn parse_config(matches: &clap::ArgMatches) -> Result<Config, Error> {
    let classes: Vec<usize> = matches
        .get_many::<usize>("classes")
        .unwrap()
        .copied()
        .collect();
    let nonzero = |name: &str, message: &'static str| {
        NonZeroUsize::new(*matches.get_one::<usize>(name).unwrap())
            .ok_or(Error::InvalidArgument(message))
    };
    let millis = |name: &str| Duration::from_millis(*matches.get_one::<u64>(name).unwrap());

    let cfg = Config {
        dynamic: DynamicConfig::from_ladder(&classes),
        fixed: FixedConfig::new(
            nonzero("item-size", "item size must be non-zero")?,
            nonzero("items", "items must be non-zero")?,
        ),
        workers: nonzero("workers", "workers must be non-zero")?,
        messages: *matches.get_one::<usize>("messages").unwrap(),
        watchdog: WatchdogConfig::new(millis("watchdog-ms")),
        reset_period: millis("reset-ms"),
    };
    cfg.validate()?;
    Ok(cfg)
}
