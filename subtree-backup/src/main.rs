//! Subtree Backup - Main entry point
//!
//! Archives a directory tree into an object store, one unit per subtree.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use subtree_backup::executor::{EventSink, JsonLinesSink, TracingSink};
use subtree_backup::{utils, Executor, FileConfig, Overrides, RunConfig, RunReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventFormat {
    /// Log events only
    Text,
    /// Also print each event as a JSON line on stdout
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target: bucket name, s3://bucket, http(s)://endpoint or a local directory
    #[arg(long)]
    bucket: Option<String>,

    /// Backup name, used as the remote key prefix
    #[arg(long)]
    name: Option<String>,

    /// Source file or directory
    #[arg(long, value_name = "PATH")]
    path: Option<PathBuf>,

    /// Storage class for archives (companions always use STANDARD)
    #[arg(long)]
    storage_class: Option<String>,

    /// Largest expected archive in GiB, used to size upload parts
    #[arg(long, value_name = "GB")]
    max_size_gb: Option<u64>,

    /// Tree depth at which units are carved out (0 = whole tree)
    #[arg(long)]
    split_depth: Option<usize>,

    /// Print the plan without contacting the target
    #[arg(long)]
    dry_run: bool,

    /// Write archives locally and verify them before upload
    #[arg(long)]
    validate: bool,

    /// Keep the local archive copy after upload
    #[arg(long)]
    keep_local: bool,

    /// Continue with the next unit after a unit fails
    #[arg(long)]
    keep_going: bool,

    /// Event output format
    #[arg(long, value_enum, default_value_t = EventFormat::Text)]
    events: EventFormat,

    /// Directory for local archive copies
    #[arg(long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    /// Fingerprint worker threads (0 = one per core)
    #[arg(long)]
    hash_workers: Option<usize>,

    /// Bearer token for http(s) targets
    #[arg(long, env = "SUBTREE_BACKUP_HTTP_TOKEN", hide_env_values = true)]
    http_token: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            storage_class: self.storage_class.clone(),
            max_size_gb: self.max_size_gb,
            split_depth: self.split_depth,
            dry_run: self.dry_run,
            validate: self.validate,
            keep_local: self.keep_local,
            keep_going: self.keep_going,
            scratch_dir: self.scratch_dir.clone(),
            hash_workers: self.hash_workers,
            http_token: self.http_token.clone(),
        }
    }
}

async fn execute(args: &Args, file: FileConfig) -> subtree_backup::Result<RunReport> {
    let config = RunConfig::resolve(file, args.overrides())?;

    let sink: Arc<dyn EventSink> = match args.events {
        EventFormat::Text => Arc::new(TracingSink),
        EventFormat::Json => Arc::new((TracingSink, JsonLinesSink::stdout())),
    };

    if config.dry_run {
        tracing::info!("Dry run: nothing will be uploaded");
    }

    Executor::new(config, sink)?.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let file = match &args.config {
        Some(path) => FileConfig::from_file(path),
        None => Ok(FileConfig::default()),
    };
    let file = match file {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&file.log.level).to_string();
    utils::logger::init(&log_level)?;

    tracing::info!("Starting subtree-backup v{}", env!("CARGO_PKG_VERSION"));

    let code = match execute(&args, file).await {
        Ok(report) => report.exit_code(),
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
