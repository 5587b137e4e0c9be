//! Command line definition for the `vacation` binary
//!
//! Flags mirror the classic single-letter benchmark options (`-c`, `-n`,
//! `-q`, `-r`, `-t`, `-u`) and add runtime tuning on top. A `--config` file
//! is applied first; explicit flags override it.

use crate::config::VacationConfig;
use crate::error::{VacationError, VacationResult};
use clap::{Arg, ArgMatches, Command};
use std::path::Path;

/// Build the command definition
pub fn build_cli() -> Command {
    Command::new("vacation")
        .about("Travel reservation benchmark on a word-based software transactional memory")
        .arg(
            Arg::new("clients")
                .short('c')
                .long("clients")
                .help("Number of client threads (default: 1)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("queries")
                .short('n')
                .long("queries")
                .help("Maximum queries per transaction (default: 10)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("query-percent")
                .short('q')
                .long("query-percent")
                .help("Percentage of relations queried (default: 90)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("relations")
                .short('r')
                .long("relations")
                .help("Number of relations per table (default: 65536)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("transactions")
                .short('t')
                .long("transactions")
                .help("Number of transactions across all clients (default: 67108864)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("user-percent")
                .short('u')
                .long("user-percent")
                .help("Percentage of reservation transactions (default: 80)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Seed for population and client random streams (default: 0)")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("TOML file with benchmark and runtime settings"),
        )
        .arg(
            Arg::new("orec-bits")
                .long("orec-bits")
                .help("log2 of the ownership-record table size")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("heap-segment-bits")
                .long("heap-segment-bits")
                .help("log2 of the words per heap segment")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("heap-segments")
                .long("heap-segments")
                .help("Number of heap segments")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("serial-after")
                .long("serial-after")
                .help("Run a transaction serially after this many consecutive conflicts")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the run report as JSON")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("print-config")
                .long("print-config")
                .help("Print a commented default config file and exit")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Resolve the run's config from parsed flags
///
/// # Errors
///
/// Returns an error if the config file cannot be loaded or the resulting
/// parameters are out of range.
pub fn matches_to_config(matches: &ArgMatches) -> VacationResult<VacationConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => VacationConfig::from_file(Path::new(path))?,
        None => VacationConfig::default(),
    };

    if let Some(&clients) = matches.get_one::<u64>("clients") {
        config.clients = usize::try_from(clients)
            .map_err(|_| VacationError::config("clients", "does not fit in usize"))?;
    }
    if let Some(&queries) = matches.get_one::<u64>("queries") {
        config.queries = queries;
    }
    if let Some(&percent) = matches.get_one::<u64>("query-percent") {
        config.query_percent = percent;
    }
    if let Some(&relations) = matches.get_one::<u64>("relations") {
        config.relations = relations;
    }
    if let Some(&transactions) = matches.get_one::<u64>("transactions") {
        config.transactions = transactions;
    }
    if let Some(&percent) = matches.get_one::<u64>("user-percent") {
        config.user_percent = percent;
    }
    if let Some(&seed) = matches.get_one::<u64>("seed") {
        config.seed = seed;
    }
    if let Some(&bits) = matches.get_one::<u32>("orec-bits") {
        config.stm.orec_bits = bits;
    }
    if let Some(&bits) = matches.get_one::<u32>("heap-segment-bits") {
        config.stm.heap_segment_bits = bits;
    }
    if let Some(&segments) = matches.get_one::<u64>("heap-segments") {
        config.stm.heap_segments = usize::try_from(segments)
            .map_err(|_| VacationError::config("heap_segments", "does not fit in usize"))?;
    }
    if let Some(&failures) = matches.get_one::<u32>("serial-after") {
        config.stm.serial_after = Some(failures);
    }

    config.validate()?;
    Ok(config)
}
