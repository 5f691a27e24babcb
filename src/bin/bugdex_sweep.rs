use std::sync::Arc;

use bugdex_rs::config::{BugdexConfig, ConfigOverrides, StoreOverrides, SweepOverrides};
use bugdex_rs::{Bugdex, Sweeper};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"bugdex_sweep - Bugdex garbage collection sweeper

USAGE:
    bugdex_sweep [OPTIONS]

OPTIONS:
    -c, --config <FILE>      Path to config file (TOML)
    -d, --data-dir <DIR>     Override store data directory
    -i, --interval <SECS>    Override seconds between sweeps
    -t, --threads <N>        Override sweep worker threads
        --repair             Repair the store before opening
        --once               Run a single sweep, print its report and exit
    -h, --help               Print help

ENVIRONMENT:
    BUGDEX_CONFIG                 Path to config file
    BUGDEX_STORE__DATA_DIR        Store data directory
    BUGDEX_SWEEP__INTERVAL_SECS   Seconds between sweeps
    RUST_LOG                      Log filter (overrides log.filter)

CONFIG FILE (bugdex.toml):
    [store]
    data_dir = "/var/lib/bugdex"

    [sweep]
    interval_secs = 300
    threads = 8
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    // Build CLI overrides
    let mut overrides = ConfigOverrides::default();
    let mut store_overrides = StoreOverrides::default();
    let mut sweep_overrides = SweepOverrides::default();

    if let Some(data_dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        store_overrides.data_dir = Some(data_dir.into());
    }
    if has_flag("--repair") {
        store_overrides.repair = Some(true);
    }
    if let Some(interval) = parse_arg("--interval").or_else(|| parse_arg("-i")) {
        sweep_overrides.interval_secs = Some(interval.parse()?);
    }
    if let Some(threads) = parse_arg("--threads").or_else(|| parse_arg("-t")) {
        sweep_overrides.threads = Some(threads.parse()?);
    }

    if store_overrides.data_dir.is_some() || store_overrides.repair.is_some() {
        overrides.store = Some(store_overrides);
    }
    if sweep_overrides.interval_secs.is_some() || sweep_overrides.threads.is_some() {
        overrides.sweep = Some(sweep_overrides);
    }

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("BUGDEX_CONFIG").ok());
    let config = BugdexConfig::load(config_path.as_deref(), overrides)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .init();

    let bugdex = Bugdex::open(&config.store)?;
    let sweeper = Arc::new(Sweeper::new(bugdex.shared_store(), config.sweep.clone())?);

    if has_flag("--once") {
        let report = sweeper.run_once()?;
        bugdex.flush()?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    println!(
        "Bugdex sweeper running every {}s against {}",
        config.sweep.interval_secs,
        config.store.data_dir.display()
    );
    sweeper.run(shutdown_rx).await?;
    bugdex.flush()?;
    Ok(())
}
