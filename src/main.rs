//! Trade Copier - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use trade_copier::config::{Config, LoggingConfig};
use trade_copier::diagnostics::LinkReport;
use trade_copier::persistence::{PersistenceManager, StateBackend, StateStore};
use trade_copier::replication::{LinkState, ManualCommand, ReplicationEngine};
use trade_copier::terminal::{BridgeClient, TerminalClient, TerminalHandle};

/// Trade Copier CLI
#[derive(Parser)]
#[command(name = "trade-copier")]
#[command(version, about = "Copies a provider account's trades onto receiver accounts")]
struct Cli {
    /// Config file (default: config.{toml,yaml,json} in the working directory)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replication loop (default)
    Run,

    /// Show copy links and pending retries from the state database
    Status {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show every link, not just live ones
        #[arg(short, long)]
        verbose: bool,
    },

    /// Close every copy of one provider position
    Close {
        /// Provider position id
        #[arg(short, long)]
        position: u64,

        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Close every live copy
    CloseAll {
        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Resume copying new trades to a receiver
    Enable {
        /// Receiver account id
        account: String,

        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },

    /// Stop copying new trades to a receiver (existing copies still follow)
    Disable {
        /// Receiver account id
        account: String,

        /// Path to SQLite database (default: persistence.db_path)
        #[arg(short, long)]
        db: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_logging(&config.logging)?;
            run(config).await
        }
        Commands::Status { db, verbose } => {
            show_status(db.as_deref().unwrap_or(&config.persistence.db_path), verbose)
        }
        Commands::Close { position, db } => queue_command(
            db.as_deref().unwrap_or(&config.persistence.db_path),
            ManualCommand::CloseOne(position),
        ),
        Commands::CloseAll { db } => queue_command(
            db.as_deref().unwrap_or(&config.persistence.db_path),
            ManualCommand::CloseAll,
        ),
        Commands::Enable { account, db } => toggle_receiver(&config, db.as_deref(), account, true),
        Commands::Disable { account, db } => toggle_receiver(&config, db.as_deref(), account, false),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║                 Trade Copier v{}                        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    config.validate()?;
    log_config(&config);

    // ═══════════════════════════════════════════════════════════════
    // Terminal connections
    // ═══════════════════════════════════════════════════════════════
    let call_timeout = Duration::from_secs(config.replication.call_timeout_secs);

    let provider_bridge = BridgeClient::new(
        &config.provider.account_id,
        &config.provider.terminal,
        config.provider.deviation_points,
    )?;
    let provider: Arc<dyn TerminalClient> = Arc::new(TerminalHandle::spawn(
        config.provider.account_id.as_str(),
        Arc::new(provider_bridge),
        call_timeout,
    ));

    let mut receivers: Vec<Arc<dyn TerminalClient>> = Vec::with_capacity(config.receivers.len());
    for receiver in &config.receivers {
        let bridge = BridgeClient::new(&receiver.account_id, &receiver.terminal, receiver.deviation_points)?;
        let handle = TerminalHandle::spawn(receiver.account_id.as_str(), Arc::new(bridge), call_timeout);
        info!("🔌 [INIT] Receiver {} -> {}", handle.account_id(), receiver.terminal.bridge_url);
        receivers.push(Arc::new(handle));
    }
    info!("✅ [INIT] {} terminal connection(s) ready", receivers.len() + 1);

    // ═══════════════════════════════════════════════════════════════
    // State
    // ═══════════════════════════════════════════════════════════════
    let db_path = &config.persistence.db_path;
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {:?}", parent))?;
        }
    }
    let backend = PersistenceManager::new(db_path).context("Failed to open state database")?;
    let store = StateStore::open(Box::new(backend)).context("Failed to load persisted state")?;

    let mut engine = ReplicationEngine::from_config(&config, provider, receivers, store)
        .context("Failed to restore retry queue")?;

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    engine.run(shutdown).await;

    info!("👋 Trade Copier shutdown complete");
    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = tracing_appender::rolling::hourly(&config.log_dir, &config.file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer flushing for the life of the process
    Box::leak(Box::new(guard));

    let crate_level = if config.actions_only { "info" } else { "debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("trade_copier={crate_level}").parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let replication = &config.replication;
    info!("📋 Configuration:");
    info!("   Provider: {} ({})", config.provider.account_id, config.provider.terminal.bridge_url);
    info!(
        "   Duplicate Provider Trades: {}",
        if replication.duplicate_provider_trades { "on" } else { "off" }
    );
    info!(
        "   Receivers: {} enabled of {}",
        config.enabled_receivers().count(),
        config.receivers.len()
    );
    for receiver in &config.receivers {
        let filter = &receiver.filter;
        info!(
            "   Receiver {}: {} | x{} | SL/TP scale {} | {}",
            receiver.account_id,
            receiver.terminal.bridge_url,
            filter.volume_multiplier,
            filter.protective_distance_scale,
            if receiver.enabled { "enabled" } else { "disabled" }
        );
    }
    info!(
        "   Retries: {} attempts, every {}s ({:?})",
        replication.max_attempts, replication.retry_interval_secs, replication.backoff
    );
    info!("   Poll Interval: {}ms", replication.poll_interval_ms);
    info!("   Call Timeout: {}s", replication.call_timeout_secs);
    info!("   State DB: {}", config.persistence.db_path);
}

/// Queue a manual command for the running copier.
fn queue_command(db_path: &str, command: ManualCommand) -> Result<()> {
    if !Path::new(db_path).exists() {
        println!("❌ Database not found: {}", db_path);
        println!("   The copier has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    persistence.enqueue_command(&command)?;
    println!("✅ Queued {:?}", command);
    println!("   The running copier picks it up on its next cycle.");
    Ok(())
}

/// Queue a receiver toggle after checking the receiver is configured.
fn toggle_receiver(config: &Config, db: Option<&str>, account_id: String, enabled: bool) -> Result<()> {
    if !config.receivers.iter().any(|r| r.account_id == account_id) {
        println!("❌ Unknown receiver: {}", account_id);
        return Ok(());
    }
    queue_command(
        db.unwrap_or(&config.persistence.db_path),
        ManualCommand::SetReceiverEnabled { account_id, enabled },
    )
}

/// Show copier status from the persisted state.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              TRADE COPIER STATUS                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The copier has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    let links = persistence.load_links()?;
    let tasks = persistence.load_retry_tasks()?;
    let snapshot = persistence.load_snapshot()?;
    let report = LinkReport::build(&links, &tasks, chrono::Utc::now());

    println!("\n📊 Links");
    for state in [
        LinkState::PendingOpen,
        LinkState::Open,
        LinkState::PendingClose,
        LinkState::Closed,
        LinkState::Failed,
    ] {
        println!("   ├─ {:<14} {}", state.as_str(), report.count(state));
    }
    println!("   └─ Archived:      {}", persistence.count_history()?);

    println!("\n📈 Activity");
    println!("   ├─ Provider Positions: {}", snapshot.len());
    println!("   ├─ Pending Retries:    {}", report.pending_retries);
    println!("   └─ Queued Commands:    {}", persistence.pending_commands()?);

    let shown: Vec<_> = report
        .links
        .iter()
        .filter(|l| verbose || !matches!(l.state, LinkState::Closed | LinkState::Failed))
        .collect();
    if !shown.is_empty() {
        println!("\n🔗 {}", if verbose { "All Links" } else { "Live Links" });
        for link in shown {
            println!("   ┌─ {} [{}]", link.link, link.state);
            println!("   ├─ {} {}", link.symbol, link.volume);
            if let Some(ticket) = link.receiver_ticket {
                println!("   ├─ Receiver Ticket: {}", ticket);
            }
            if let Some(next) = link.next_retry {
                println!("   ├─ Next Retry: {} (attempts {})", next.format("%H:%M:%S UTC"), link.attempts);
            }
            if let Some(error) = &link.last_error {
                println!("   ├─ Last Error: {}", error);
            }
            println!("   └─ Age: {}s", link.age_secs);
        }
    }

    let failed = report.count(LinkState::Failed);
    if failed > 0 {
        println!("\n⚠️  {} failed link(s) need review", failed);
    }

    Ok(())
}
