use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use dotenv::dotenv;
use mcprobe::{
    config::Config,
    database::ServerStore,
    exclude,
    processing::spawn_aggregator,
    scanner::{
        ScanSettings, Scanner,
        protocols::Prober,
        targets::RandomAddresses,
    },
    terminal_colors::*,
    tracing::init_tracing,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

enum Mode {
    Scan,
    Refresh,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    // `mcprobe [config.toml]` scans, `mcprobe refresh [config.toml]` re-pings
    // the servers we already know about
    let mut args = env::args().skip(1).peekable();
    let mode = if args.peek().map(String::as_str) == Some("refresh") {
        args.next();
        Mode::Refresh
    } else {
        Mode::Scan
    };
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| "config.toml".to_string()));

    let config = Config::load(&config_path)?;

    init_tracing(&config);
    info!("Logging initialized");
    if !config_path.exists() {
        info!("{} doesn't exist, using the default config", config_path.display());
    }

    match mode {
        Mode::Scan => scan(config).await,
        Mode::Refresh => refresh(config).await,
    }
}

async fn scan(config: Config) -> eyre::Result<()> {
    let exclude_ranges = exclude::load(config.exclude_file.as_deref())?;
    info!(
        "excluding {} ips ({} ranges)",
        exclude_ranges.count(),
        exclude_ranges.ranges().len()
    );
    let addresses = RandomAddresses::new(exclude_ranges, config.target.port)?;

    let store = Arc::new(ServerStore::open(&config.servers_file));
    let known = store.load().servers.len();
    info!("saving servers to {} ({known} already known)", store.path().display());

    let scanner = Scanner::new(
        Arc::new(addresses),
        Arc::new(Prober::from_config(&config)),
        store,
        ScanSettings::from_config(&config),
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                println!("{YELLOW}Interrupted, waiting for the probes in flight to finish...{RESET}");
                ctrl_c_cancel.cancel();
            }
            Err(err) => warn!("couldn't listen for ctrl+c: {err}"),
        }
    });

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let aggregator = spawn_aggregator(events_rx, config.scanner.progress_every);

    println!(
        "{BOLD}Scanning{RESET} {GRAY}batches of {}, {} at a time, {}s timeout{RESET}",
        config.scanner.batch_size, config.scanner.concurrency, config.scanner.timeout_secs
    );
    let start_time = Instant::now();
    let batches = scanner
        .run(&cancel, &events_tx, config.debug.exit_after_batches)
        .await;

    drop(events_tx);
    let totals = aggregator.await?;

    info!(
        "scanned {batches} batches in {:.1}s",
        start_time.elapsed().as_secs_f64()
    );
    println!(
        "{BOLD}Done.{RESET} {} batches, {} addresses processed, {GREEN}{} servers found{RESET} ({BLUE}{} new{RESET})",
        totals.batches, totals.processed, totals.found, totals.new_servers
    );

    Ok(())
}

async fn refresh(config: Config) -> eyre::Result<()> {
    let store = Arc::new(ServerStore::open(&config.servers_file));
    let prober = Prober::from_config(&config).with_fallback_timeout(config.refresh.timeout());

    let outcome = store
        .refresh_all(
            &prober,
            config.refresh.concurrency,
            config.refresh.timeout(),
            |done, total| {
                print!("\rRefreshing servers... {done}/{total}");
                let _ = io::stdout().flush();
            },
        )
        .await?;
    println!();

    if outcome.servers.is_empty() {
        println!(
            "{GRAY}No servers in {} yet, run a scan first.{RESET}",
            store.path().display()
        );
        return Ok(());
    }

    for line in outcome.listing() {
        println!("{line}");
    }
    println!(
        "{GREEN}{} online{RESET}, {GRAY}{} offline{RESET}",
        outcome.responsive, outcome.offline
    );

    Ok(())
}
