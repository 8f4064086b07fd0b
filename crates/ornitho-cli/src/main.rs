use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ornitho_adapters::{OrnithoListingSource, TableNameLookup};
use ornitho_core::render_notification;
use ornitho_storage::SightingStore;
use ornitho_sync::{ConsoleNotifier, ReconcilePolicy, SightingStream, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ornitho-notify")]
#[command(about = "Print ornitho.cat sightings not reported by a previous run")]
struct Cli {
    /// State file (overrides ORNITHO_STATE_FILE)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the listing and print new sightings (default)
    Run {
        /// cursor | full-set (overrides ORNITHO_POLICY)
        #[arg(long)]
        policy: Option<ReconcilePolicy>,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        max_notifications: Option<usize>,
        /// Print but do not update the state file
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON on stderr
        #[arg(long)]
        json: bool,
    },
    /// Print the stored state
    ShowState,
    /// Delete the stored state; the next run starts from scratch
    ResetState,
    /// Merge and print sightings from saved listing pages (page-1.html, page-2.html, ...)
    ParseFixture {
        dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        max_pages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ornitho=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if let Some(path) = cli.state_file {
        config.state_file = path;
    }

    let command = cli.command.unwrap_or(Commands::Run {
        policy: None,
        max_pages: None,
        max_notifications: None,
        dry_run: false,
        json: false,
    });

    match command {
        Commands::Run {
            policy,
            max_pages,
            max_notifications,
            dry_run,
            json,
        } => {
            if let Some(max) = max_notifications {
                config.set_max_notifications(max);
            }
            if let Some(policy) = policy {
                config.set_policy(policy);
            }
            if let Some(max_pages) = max_pages {
                config.listing.max_pages = max_pages;
            }
            config.dry_run |= dry_run;

            let mut pipeline = SyncPipeline::new(config)?;
            let mut notifier = ConsoleNotifier::stdout();
            let summary = pipeline.run_once(&mut notifier).await?;
            if json {
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                eprintln!(
                    "sync complete: run_id={} policy={} pages={} observed={} notified={} state_saved={}",
                    summary.run_id,
                    summary.policy,
                    summary.pages_fetched,
                    summary.observed,
                    summary.notified,
                    summary.state_saved
                );
            }
        }
        Commands::ShowState => {
            let store = SightingStore::new(&config.state_file);
            let state = store.load().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&state).context("serializing state")?
            );
        }
        Commands::ResetState => {
            let store = SightingStore::new(&config.state_file);
            store.clear().await?;
            info!(path = %store.path().display(), "state cleared");
        }
        Commands::ParseFixture { dir, max_pages } => {
            let names = TableNameLookup::from_yaml_file(&config.names_file)?;
            let mut source = OrnithoListingSource::fixtures(dir, max_pages);
            let mut stream = SightingStream::new(&mut source).with_lookup(&names);
            let mut count = 0usize;
            while let Some(sighting) = stream.next().await? {
                println!("{}", render_notification(&sighting));
                count += 1;
            }
            eprintln!(
                "parsed {count} sightings from {} pages{}",
                stream.pages_fetched(),
                if stream.ended_on_miss() { " (ended on a transient miss)" } else { "" }
            );
        }
    }

    Ok(())
}
