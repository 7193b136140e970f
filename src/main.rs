//! dhtscout CLI: scrape peers for a torrent, or crawl the DHT for
//! info_hashes.
//!
//! With a positional info_hash the tool runs in scraper mode; without one it
//! crawls. Exit codes: 0 success, 1 invalid arguments, 2 runtime failure.

use std::io::Write as _;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dhtscout::dht::{CancelFlag, DhtEngine, EngineConfig, InfoHash};
use dhtscout::progress;

#[derive(Parser)]
#[command(
    name = "dhtscout",
    version,
    about = "BitTorrent DHT peer scraper and infohash crawler"
)]
struct Cli {
    /// Torrent info_hash as a 40-character hex string; omit to crawl the DHT
    info_hash: Option<String>,

    /// UDP port to bind; falls back to an ephemeral port when taken
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Duration in seconds: scrape timeout, or crawl length (0 = until Ctrl-C)
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Seconds between active find_node bursts in crawler mode
    #[arg(long, default_value_t = 3)]
    query_interval: u64,

    /// Override bootstrap nodes (host:port, repeatable)
    #[arg(long)]
    bootstrap: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    if cli.query_interval < 1 {
        eprintln!("error: --query-interval must be at least 1");
        return ExitCode::from(1);
    }

    let info_hash = match cli.info_hash.as_deref() {
        Some(hex) => match InfoHash::from_hex(hex.trim()) {
            Ok(hash) => Some(hash),
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(1);
            }
        },
        None => None,
    };

    match run(cli, info_hash) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn run(cli: Cli, info_hash: Option<InfoHash>) -> anyhow::Result<ExitCode> {
    let config = EngineConfig {
        port: cli.port,
        bootstrap: if cli.bootstrap.is_empty() {
            EngineConfig::default().bootstrap
        } else {
            cli.bootstrap.clone()
        },
        ..EngineConfig::default()
    };

    let mut engine = DhtEngine::bind(config).await.context("binding UDP socket")?;
    println!(
        "dhtscout listening on port {} (node id {})",
        engine.port(),
        engine.local_id()
    );

    println!("bootstrapping from the DHT...");
    let nodes = engine.bootstrap().await.context("bootstrapping")?;
    if nodes == 0 {
        anyhow::bail!("bootstrap completed but the routing table is empty; check connectivity");
    }
    println!("routing table populated with {} nodes", nodes);

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let code = match info_hash {
        Some(hash) => scrape(&mut engine, hash, cli.timeout, &cancel).await,
        None => crawl(&mut engine, cli.timeout, cli.query_interval, &cancel).await,
    };
    Ok(code)
}

async fn scrape(
    engine: &mut DhtEngine,
    hash: InfoHash,
    timeout_secs: u64,
    cancel: &CancelFlag,
) -> ExitCode {
    println!(
        "searching for peers of {} ({}s timeout)...",
        hash, timeout_secs
    );
    let peers = engine
        .scrape_peers(hash, Duration::from_secs(timeout_secs), cancel)
        .await;

    if peers.is_empty() {
        println!("no peers found; the torrent may be rare or inactive");
        return ExitCode::SUCCESS;
    }

    println!("found {} peer(s):", peers.len());
    for (i, peer) in peers.iter().take(50).enumerate() {
        println!("{:3}. {}", i + 1, peer);
    }
    if peers.len() > 50 {
        println!("... and {} more", peers.len() - 50);
    }
    ExitCode::SUCCESS
}

async fn crawl(
    engine: &mut DhtEngine,
    duration_secs: u64,
    query_interval: u64,
    cancel: &CancelFlag,
) -> ExitCode {
    if duration_secs == 0 {
        println!("crawling the DHT until Ctrl-C...");
    } else {
        println!(
            "crawling the DHT for {}s (Ctrl-C to stop early)...",
            duration_secs
        );
    }

    let mut seen = 0u64;
    let report = engine
        .crawl(
            Duration::from_secs(duration_secs),
            query_interval,
            cancel,
            |discovery| {
                seen += 1;
                println!(
                    "{}[{:4}] {}  (from {}, {})",
                    progress::CLEAR_LINE,
                    seen,
                    discovery.info_hash,
                    discovery.source,
                    discovery.origin
                );
            },
            |stats| {
                print!(
                    "{}{}",
                    progress::CLEAR_LINE,
                    progress::format_progress_line(stats)
                );
                let _ = std::io::stdout().flush();
            },
        )
        .await;

    println!();
    println!(
        "crawl finished in {}",
        progress::format_elapsed(report.elapsed.as_secs())
    );
    println!(
        "discovered {} unique info_hash(es), {} requests seen, {} parse errors",
        report.discovered.len(),
        report.total_requests,
        report.parse_errors
    );

    if !report.discovered.is_empty() {
        println!();
        println!("top info_hashes by request count:");
        for (i, entry) in report.discovered.iter().take(20).enumerate() {
            println!(
                "{:3}. {}  ({} requests, {} sources, via {})",
                i + 1,
                entry.info_hash,
                entry.requests,
                entry.sources,
                entry.origin
            );
        }
        if report.discovered.len() > 20 {
            println!("... and {} more", report.discovered.len() - 20);
        }
    }
    ExitCode::SUCCESS
}
