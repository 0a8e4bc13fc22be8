//! coldstash - main entry point

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use coldstash::executor::BackupExecutor;
use coldstash::prompt::ConsolePrompter;
use coldstash::restore::{ObjectSource, RestoreCoordinator, RestoreRequest};
use coldstash::shutdown::ShutdownCoordinator;
use coldstash::store::{LocalStore, RetrievalTier};
use coldstash::{utils, AppConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Archive, split, encrypt and upload the tasks of a manifest
    Backup(BackupArgs),
    /// Fetch objects back, requesting archival retrieval where needed
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct BackupArgs {
    /// Task manifest
    #[arg(long = "json", value_name = "FILE")]
    manifest: PathBuf,

    /// Prepare everything locally but upload nothing
    #[arg(long)]
    dry_run: bool,

    /// Object store root directory (overrides config)
    #[arg(long, value_name = "DIR")]
    store_root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Bucket to restore from
    #[arg(long, required_unless_present = "simulate")]
    bucket: Option<String>,

    /// Only objects below this key prefix
    #[arg(long, default_value = "")]
    prefix: String,

    /// Object list instead of a bucket listing
    #[arg(long = "json", value_name = "FILE")]
    objects: Option<PathBuf>,

    /// Where restored files are written
    #[arg(long, value_name = "DIR")]
    destination: PathBuf,

    /// Treat a local directory as the bucket
    #[arg(long, value_name = "DIR", conflicts_with = "objects")]
    simulate: Option<PathBuf>,

    /// bulk, standard or expedited
    #[arg(long)]
    retrieval_tier: Option<String>,

    /// Days a retrieved copy stays readable
    #[arg(long)]
    available_days: Option<u32>,

    /// Poll pending retrievals every N minutes until all are readable
    #[arg(long, value_name = "N")]
    auto_retry_minutes: Option<u64>,

    /// Leave .tar.gz archives packed
    #[arg(long)]
    skip_decompression: bool,

    /// Do not ask before listing-based restores or retrieval requests
    #[arg(long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting coldstash v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let _signals = shutdown.listen();

    match cli.command {
        Command::Backup(args) => {
            if let Some(root) = args.store_root {
                config.store.root = root;
            }
            let store = Arc::new(LocalStore::new(&config.store.root));
            let summary = BackupExecutor::with_cancel(&config, store, shutdown.token())
                .dry_run(args.dry_run)
                .execute(&args.manifest)
                .await?;

            println!("{}", summary);
            if !summary.is_success() {
                bail!("{} task(s) failed", summary.failed);
            }
        }
        Command::Restore(args) => {
            if let Some(tier) = &args.retrieval_tier {
                config.restore.retrieval_tier = RetrievalTier::parse_lenient(tier);
            }
            if let Some(days) = args.available_days {
                config.restore.available_days = days;
            }
            if args.auto_retry_minutes.is_some() {
                config.restore.poll_interval_minutes = args.auto_retry_minutes;
            }
            config.restore.skip_decompression |= args.skip_decompression;
            config.restore.without_confirmation |= args.yes;
            config.validate()?;

            let (store, request) = match args.simulate {
                Some(dir) => (
                    LocalStore::new(&dir),
                    RestoreRequest {
                        bucket: String::new(),
                        prefix: args.prefix,
                        source: ObjectSource::LocalScan(dir),
                        destination: args.destination,
                    },
                ),
                None => (
                    LocalStore::new(&config.store.root),
                    RestoreRequest {
                        bucket: args.bucket.unwrap_or_default(),
                        prefix: args.prefix,
                        source: args
                            .objects
                            .map(ObjectSource::File)
                            .unwrap_or(ObjectSource::Listing),
                        destination: args.destination,
                    },
                ),
            };

            let summary = RestoreCoordinator::with_cancel(
                &config,
                Arc::new(store),
                Arc::new(ConsolePrompter),
                shutdown.token(),
            )
            .run(&request)
            .await?;

            println!("{}", summary);
            if !summary.is_success() {
                bail!("{} object(s) failed", summary.failed);
            }
        }
    }

    Ok(())
}
