use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};

use payload_extractor::payload::Payload;
use payload_extractor::progress::ProgressReporter;
use payload_extractor::scheduler;

#[derive(Debug, Parser)]
#[clap(
    bin_name = env!("CARGO_PKG_NAME"),
    about,
    author,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Path to a payload.bin, a ZIP containing one, or an http(s):// URL to either
    #[clap(value_hint = ValueHint::AnyPath, value_name = "SOURCE")]
    source: String,

    /// Directory to write extracted partition images into
    #[clap(long, short, value_hint = ValueHint::DirPath, value_name = "PATH", default_value = "output")]
    out: PathBuf,

    /// Extract only these partitions (comma-separated); default is all
    #[clap(long, value_delimiter = ',', value_name = "NAMES")]
    images: Vec<String>,

    /// List the partitions in the payload and exit, without extracting
    #[clap(long)]
    list: bool,

    /// Number of worker threads (default: CPU count, clamped to 8)
    #[clap(long, short, value_name = "N")]
    threads: Option<usize>,

    /// Override the User-Agent header sent for HTTP(S) sources
    #[clap(long, value_name = "UA")]
    user_agent: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let payload = open_payload(&cli.source, cli.user_agent.as_deref())
        .with_context(|| format!("unable to open payload source {:?}", cli.source))?;

    if cli.list {
        let summary = payload.list_summary();
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            tracing::warn!("received interrupt, cancelling after the current operation");
            cancel.store(true, Ordering::SeqCst);
        })
        .context("unable to install Ctrl-C handler")?;
    }

    let threads = cli.threads.unwrap_or_else(scheduler::default_thread_count);
    let progress = ProgressReporter::new();

    scheduler::extract(payload, &cli.images, &cli.out, threads, &progress, &cancel)
        .context("extraction failed")?;

    Ok(())
}

fn open_payload(source: &str, user_agent: Option<&str>) -> payload_extractor::Result<Payload> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Payload::open_http(source, user_agent)
    } else {
        Payload::open_file(std::path::Path::new(source))
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "payload_extractor=info",
        1 => "payload_extractor=debug",
        _ => "payload_extractor=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
