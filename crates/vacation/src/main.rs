//! vacation: travel reservation benchmark on the word-based STM
//!
//! Usage: `vacation [-c CLIENTS] [-n QUERIES] [-q PERCENT] [-r RELATIONS]
//! [-t TRANSACTIONS] [-u PERCENT] [--config FILE] [--json]`
//!
//! Logging goes to stderr and is controlled with `RUST_LOG`.

use std::io::Write;
use std::process;

use tracing_subscriber::EnvFilter;
use vacation::cli::{build_cli, matches_to_config};
use vacation::{Benchmark, RunReport, VacationConfig, VacationResult};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();

    if matches.get_flag("print-config") {
        print!("{}", VacationConfig::default_toml());
        return;
    }

    let config = match matches_to_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let json = matches.get_flag("json");
    if let Err(e) = run(config, json) {
        eprintln!("(error) {}", e);
        process::exit(1);
    }
}

fn run(config: VacationConfig, json: bool) -> VacationResult<()> {
    progress(json, "Initializing manager... ");
    let bench = Benchmark::setup(config)?;
    done(json);

    if !json {
        let config = bench.config();
        println!("Initializing clients... done.");
        println!("    Transactions        = {}", config.transactions);
        println!("    Clients             = {}", config.clients);
        println!("    Transactions/client = {}", config.transactions_per_client());
        println!("    Queries/transaction = {}", config.queries);
        println!("    Relations           = {}", config.relations);
        println!("    Query percent       = {}", config.query_percent);
        println!("    Query range         = {}", config.query_range());
        println!("    Percent user        = {}", config.user_percent);
    }

    progress(json, "Running clients... ");
    let report = bench.run()?;
    done(json);
    if !json {
        println!("Time = {:.6}", report.elapsed.as_secs_f64());
        print_summary(&report);
    }

    progress(json, "Checking tables... ");
    let consistency = bench.check()?;
    done(json);

    progress(json, "Deallocating memory... ");
    let teardown = bench.teardown()?;
    done(json);

    if json {
        let out = serde_json::json!({
            "run": report,
            "consistency": consistency,
            "teardown": teardown,
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
    } else if teardown.leaked_blocks != 0 {
        println!("    Leaked blocks       = {}", teardown.leaked_blocks);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let m = &report.metrics;
    println!("    Throughput          = {:.0} txn/s", report.throughput());
    println!("    Attempts            = {}", m.total_started);
    println!("    Commits             = {}", m.total_committed);
    println!("    Aborts              = {} ({:.2}%)", m.total_aborted, m.abort_rate() * 100.0);
    println!("    Serial attempts     = {}", m.serial_entries);
    println!("    Reservations made   = {}", report.clients_total.reservations_made);
    println!("    Customers deleted   = {}", report.clients_total.customers_deleted);
    println!("    Table updates       = {}", report.clients_total.updates_applied);
}

fn progress(json: bool, msg: &str) {
    if !json {
        print!("{}", msg);
        let _ = std::io::stdout().flush();
    }
}

fn done(json: bool) {
    if !json {
        println!("done.");
    }
}
