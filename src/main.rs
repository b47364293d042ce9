//! Contact Harvester CLI
//!
//! - `harvest`: walk one or all sources within a URL budget
//! - `status`: cursor, stats and circuit state per source
//! - `reset`: operator re-enable of a tripped source
//! - `patterns`: import and list source patterns

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use contact_harvester::config::Config;
use contact_harvester::harvester::{Harvester, RunOptions, SourceStatus};
use contact_harvester::metrics::start_metrics_server;
use contact_harvester::pattern::PatternRegistry;
use contact_harvester::schemas::RunSummary;
use contact_harvester::store;

/// Contact Harvester - resumable multi-source directory harvesting
#[derive(Parser, Debug)]
#[command(name = "contact-harvester")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resumable multi-source contact harvesting with cumulative circuit breaking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Harvest contacts from one source or all of them
    Harvest {
        /// Source id, or "all"
        #[arg(short, long, default_value = "all")]
        source: String,

        /// Page loads allowed per source in this invocation
        #[arg(short = 'n', long)]
        max_urls: Option<u32>,

        /// Fetch and extract without writing anything
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Show cursor, stats and circuit state of sources
    Status {
        /// Single source (default: all)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Re-enable a source
    Reset {
        #[arg(short, long)]
        source: String,

        /// Zero stats and clear the trip
        #[arg(long)]
        stats: bool,

        /// Rewind the cursor to the first page
        #[arg(long)]
        cursor: bool,
    },

    /// Manage source patterns
    Patterns {
        #[command(subcommand)]
        action: PatternCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PatternCommand {
    /// Import one entry or an array of entries from a JSON file
    Import { file: PathBuf },
    /// List registered patterns
    List,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Cancels `token` on SIGTERM/SIGINT so in-flight fetches are abandoned
/// and no partial page is persisted
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping after the current page...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping after the current page...");
        }
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    let run_id = uuid::Uuid::new_v4().to_string();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = %run_id,
        "Starting Contact Harvester"
    );

    let config = Config::load()?;
    config.validate()?;

    info!(
        storage_type = %config.storage_type,
        browserless = config.has_browserless(),
        empty_threshold = config.empty_threshold,
        purge_policy = config.purge_policy.as_str(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Harvest { source, max_urls, dry_run } => {
            let options = RunOptions {
                max_urls: max_urls.unwrap_or(config.default_max_urls),
                dry_run,
            };
            harvest(config, &run_id, &source, options).await?;
        }

        Commands::Status { source } => {
            show_status(config, &run_id, source.as_deref()).await?;
        }

        Commands::Reset { source, stats, cursor } => {
            reset_source(config, &run_id, &source, stats, cursor).await?;
        }

        Commands::Patterns { action } => {
            manage_patterns(config, action).await?;
        }
    }

    Ok(())
}

async fn harvest(config: Config, run_id: &str, source: &str, options: RunOptions) -> Result<()> {
    if config.metrics_enabled {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port = config.metrics_port, "Metrics server started at /metrics");
    }

    let harvester = Harvester::from_config(&config, run_id).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    info!(
        source = %source,
        max_urls = options.max_urls,
        dry_run = options.dry_run,
        "Starting harvest"
    );

    let summaries = if source == "all" {
        harvester.run_all(options, &cancel).await?
    } else {
        vec![harvester.run_source(source, options, &cancel).await?]
    };

    print_summaries(&summaries);
    Ok(())
}

fn print_summaries(summaries: &[RunSummary]) {
    println!("\n📊 Harvest Summary");
    println!("==================");
    if summaries.is_empty() {
        println!("No sources registered (see `patterns import`)");
        return;
    }

    println!(
        "{:<24} {:<18} {:>6} {:>8} {:>6} {:>8} {:>8}",
        "Source", "Outcome", "URLs", "New", "Dups", "Invalid", "Errors"
    );
    println!("{}", "-".repeat(84));
    for s in summaries {
        println!(
            "{:<24} {:<18} {:>6} {:>8} {:>6} {:>8} {:>8}",
            s.source_id,
            s.outcome.as_str(),
            s.urls_visited,
            s.contacts_found,
            s.duplicates,
            s.invalid,
            s.http_errors + s.network_errors + s.blocked + s.structural_mismatches,
        );
    }

    let total: u64 = summaries.iter().map(|s| s.contacts_found).sum();
    println!("\nNew contacts: {}", total);
    if summaries.iter().any(|s| s.dry_run) {
        println!("(dry run: nothing was written)");
    }
}

async fn show_status(config: Config, run_id: &str, source: Option<&str>) -> Result<()> {
    let harvester = Harvester::from_config(&config, run_id).await?;

    let statuses = match source {
        Some(id) => vec![harvester.status(id).await?],
        None => harvester.status_all().await?,
    };

    println!("\n📡 Contact Harvester Status");
    println!("===========================\n");
    println!("Storage: {} ({})", config.storage_type, config.data_dir.display());
    println!();

    if statuses.is_empty() {
        println!("No sources registered");
        return Ok(());
    }

    for status in &statuses {
        print_status(status);
    }
    Ok(())
}

fn print_status(status: &SourceStatus) {
    let circuit = if status.stats.is_tripped() { "❌ tripped" } else { "✅ active" };
    let position = if status.cursor.exhausted {
        "exhausted".to_string()
    } else {
        format!(
            "category {} page {}, {} categories done",
            status.cursor.category_code.as_deref().unwrap_or("-"),
            status.cursor.pages_completed + 1,
            status.cursor.completed_category_codes.len()
        )
    };

    println!("{} ({})", status.pattern.source_id, status.pattern.pagination.kind());
    println!("  Circuit:   {}", circuit);
    println!("  Cursor:    {}", position);
    if status.cursor.failed_pages > 0 {
        println!("  Failing:   {} consecutive failed page(s) at the cursor", status.cursor.failed_pages);
    }
    println!(
        "  Stats:     {} URLs, {} contacts, {} consecutive empty, {} runs",
        status.stats.urls_visited,
        status.stats.contacts_found,
        status.stats.consecutive_empty_urls,
        status.stats.runs
    );
    println!("  Stored:    {} contacts", status.contacts);
    if let Some(last) = status.cursor.last_run_at {
        // Whole seconds keep the output short
        let ago = (chrono::Utc::now() - last).to_std().unwrap_or_default();
        println!(
            "  Last page: {} ago",
            humantime::format_duration(Duration::from_secs(ago.as_secs()))
        );
    }
    if let Some(mark) = &status.pattern.non_productive {
        println!("  Marked:    {} ({})", mark.reason, mark.marked_at.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
}

async fn reset_source(config: Config, run_id: &str, source: &str, stats: bool, cursor: bool) -> Result<()> {
    if !stats && !cursor {
        anyhow::bail!("Nothing to reset: pass --stats and/or --cursor");
    }

    let harvester = Harvester::from_config(&config, run_id).await?;
    harvester.reset(source, stats, cursor).await?;

    if stats {
        println!("✅ Reset stats and circuit for source: {}", source);
    }
    if cursor {
        println!("✅ Rewound cursor for source: {}", source);
    }
    Ok(())
}

async fn manage_patterns(config: Config, action: PatternCommand) -> Result<()> {
    let sink = store::create_sink(&config).await?;
    let registry = PatternRegistry::new(sink);

    match action {
        PatternCommand::Import { file } => {
            let count = registry.import_file(&file).await?;
            println!("✅ Imported {} pattern(s) from {}", count, file.display());
        }
        PatternCommand::List => {
            let entries = registry.list().await?;
            println!("\n{:<24} {:<20} {:>10} {:<10}", "Source", "Pagination", "Categories", "State");
            println!("{}", "-".repeat(68));
            for entry in &entries {
                println!(
                    "{:<24} {:<20} {:>10} {:<10}",
                    entry.source_id,
                    entry.pagination.kind(),
                    entry.categories.len(),
                    if entry.is_productive() { "productive" } else { "retired" }
                );
            }
            println!("\nTotal: {} patterns", entries.len());
        }
    }
    Ok(())
}
