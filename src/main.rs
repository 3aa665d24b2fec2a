//! Signal Hub - Main Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use signal_hub::alerts::{AlertDispatcher, AlertSink, LogAlertSink, TelegramAlertSink};
use signal_hub::bus::{MemoryBus, RedisBus, SignalBus};
use signal_hub::config::{BusBackend, Config};
use signal_hub::decision::{DecisionProvider, HoldProvider, HttpDecisionProvider};
use signal_hub::market::{InstrumentCatalog, StaticCatalog};
use signal_hub::persistence::{
    MarkerStore, MemoryMarkerStore, OpenPositionGuard, PositionStatus,
    PositionWriter, RedisMarkerStore, SqliteJournal,
};
use signal_hub::relay::{Relay, RelayServer};
use signal_hub::risk::AdmissionController;
use signal_hub::scheduler::{EvaluatorQueues, InstrumentEvaluator, ScanScheduler};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Signal Hub CLI
#[derive(Parser)]
#[command(name = "signal-hub")]
#[command(version, about = "Risk-gated trading signal production and distribution")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scan scheduler, relay and WebSocket server (default)
    Run,

    /// Show published signals, risk state and open positions
    Status {
        /// Show signal rationale and position levels
        #[arg(short, long)]
        verbose: bool,
    },

    /// Clear every entry from the signal bus
    Reset,

    /// Close the open position for a symbol
    Close {
        /// Instrument symbol (e.g. BBCA.JK)
        #[arg(short, long)]
        symbol: String,

        /// Outcome of the trade
        #[arg(short, long, value_enum)]
        outcome: Outcome,

        /// Realized profit or loss
        #[arg(short, long, allow_hyphen_values = true)]
        pnl: Decimal,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Outcome {
    Win,
    Loss,
}

impl From<Outcome> for PositionStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Win => PositionStatus::Win,
            Outcome::Loss => PositionStatus::Loss,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Status { verbose } => show_status(&config, verbose).await,
        Commands::Reset => reset_bus(&config).await,
        Commands::Close {
            symbol,
            outcome,
            pnl,
        } => close_position(&config, &symbol, outcome.into(), pnl),
    }
}

/// Wire every component and run until ctrl-c.
async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║                  Signal Hub v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let journal = Arc::new(open_journal(&config.persistence.db_path)?);
    let (bus, markers) = connect_bus(&config).await?;

    let guard = Arc::new(OpenPositionGuard::new(
        journal.clone(),
        markers,
        config.bus.marker_ttl(),
    ));
    let admission = Arc::new(AdmissionController::new(
        config.risk.clone(),
        journal.clone(),
    ));

    match admission.risk_state().await {
        Ok(state) => info!(
            "🛡️  Risk state: daily loss {} / {}, loss streak {}",
            state.daily_loss, state.daily_loss_limit, state.loss_streak
        ),
        Err(e) => warn!(error = %e, "Risk state unavailable at startup"),
    }

    let provider: Arc<dyn DecisionProvider> = match &config.decision.endpoint {
        Some(endpoint) => {
            info!("🧠 Decision endpoint: {}", endpoint);
            Arc::new(HttpDecisionProvider::new(
                endpoint,
                config.scheduler.decision_timeout(),
            )?)
        }
        None => {
            warn!("⚠️  No decision endpoint configured, holding on every instrument");
            Arc::new(HoldProvider)
        }
    };

    let catalog: Arc<dyn InstrumentCatalog> = if config.instruments.is_empty() {
        Arc::new(StaticCatalog::default_universe())
    } else {
        Arc::new(StaticCatalog::from_specs(&config.instruments))
    };

    // Alert and position queues, each drained by its own consumer
    let (alert_tx, alert_rx) = mpsc::channel(config.alerts.queue_capacity.max(1));
    let (position_tx, position_rx) = mpsc::channel(config.persistence.queue_capacity.max(1));

    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    if let (Some(token), Some(chat_id)) = (
        &config.alerts.telegram_bot_token,
        &config.alerts.telegram_chat_id,
    ) {
        info!("📨 Telegram alerts enabled");
        sinks.push(Arc::new(TelegramAlertSink::new(
            &config.alerts.telegram_api_url,
            token,
            chat_id,
        )?));
    }
    let alert_task = tokio::spawn(AlertDispatcher::new(sinks).run(alert_rx));
    let writer_task =
        tokio::spawn(PositionWriter::new(journal.clone(), guard.clone()).run(position_rx));

    let evaluator = Arc::new(InstrumentEvaluator::new(
        bus.clone(),
        provider,
        admission,
        guard,
        &config.risk,
        config.scheduler.decision_timeout(),
        EvaluatorQueues {
            alerts: alert_tx,
            positions: position_tx,
        },
    ));
    let scheduler = Arc::new(ScanScheduler::new(
        config.scheduler.clone(),
        catalog,
        evaluator,
    ));

    let relay = Arc::new(Relay::new(config.relay.client_buffer));
    let relay_task = tokio::spawn(relay.clone().run(
        config.relay.mode,
        bus.clone(),
        config.relay.poll_interval(),
        shutdown_rx.clone(),
    ));

    let server = Arc::new(RelayServer::new(
        relay,
        bus.clone(),
        config.relay.send_timeout(),
    ));
    let listen_addr = config.relay.listen_addr.clone();
    let server_rx = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve(&listen_addr, server_rx).await {
            error!(error = %e, "Relay server failed");
        }
    });

    let mut supervisor_task = tokio::spawn(scheduler.supervise(shutdown_rx.clone()));

    info!("🚀 Signal hub running");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    tokio::signal::ctrl_c().await.ok();
    info!("🛑 Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // One grace period covers every wait below
    let grace = config.scheduler.shutdown_grace();
    let deadline = Instant::now() + grace;

    if timeout_at(deadline, &mut supervisor_task).await.is_err() {
        warn!("Scan scheduler did not stop within {:?}, cancelling", grace);
        supervisor_task.abort();
    }
    // Queue consumers finish once the scheduler's senders are gone
    if timeout_at(deadline, async {
        let _ = alert_task.await;
        let _ = writer_task.await;
    })
    .await
    .is_err()
    {
        warn!("Queue consumers did not drain within {:?}", grace);
    }
    let _ = timeout_at(deadline, relay_task).await;
    let _ = timeout_at(deadline, server_task).await;

    info!("👋 Signal hub stopped");
    Ok(())
}

fn open_journal(db_path: &str) -> Result<SqliteJournal> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
    }
    SqliteJournal::new(db_path)
}

/// Build the configured bus backend and its matching marker store.
async fn connect_bus(config: &Config) -> Result<(Arc<dyn SignalBus>, Arc<dyn MarkerStore>)> {
    let bus: Arc<dyn SignalBus>;
    let markers: Arc<dyn MarkerStore>;

    match config.bus.backend {
        BusBackend::Memory => {
            info!("🗂️  Signal bus: in-process");
            bus = Arc::new(MemoryBus::new(config.bus.notify_capacity));
            markers = Arc::new(MemoryMarkerStore::new());
        }
        BusBackend::Redis => {
            info!("🗂️  Signal bus: Redis");
            bus = Arc::new(
                RedisBus::connect(&config.bus.redis_url, config.bus.notify_capacity).await?,
            );
            markers = Arc::new(RedisMarkerStore::connect(&config.bus.redis_url).await?);
        }
    }

    Ok((bus, markers))
}

/// Initialize logging to stdout and hourly rolling files.
///
/// `LOG_FORMAT=json` switches both outputs to JSON lines.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "signal-hub.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("signal_hub=debug".parse()?)
        .add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Scan Interval: {}s (concurrency {}, timeout {}s)",
        config.scheduler.scan_interval_secs,
        config.scheduler.max_concurrency,
        config.scheduler.decision_timeout_secs
    );
    info!("   Balance: {}", config.risk.balance);
    info!(
        "   Max Daily Loss: {:.1}%",
        config.risk.max_daily_loss_pct * dec!(100)
    );
    info!(
        "   Max Loss Streak: {} (last {} closed)",
        config.risk.max_consecutive_losses, config.risk.streak_lookback
    );
    info!(
        "   Max Correlated Positions: {}",
        config.risk.max_correlated_positions
    );
    info!(
        "   Risk Per Trade: {:.2}%",
        config.risk.risk_per_trade * dec!(100)
    );
    info!(
        "   Relay: {:?} on {}",
        config.relay.mode, config.relay.listen_addr
    );
}

/// Print published signals, risk state and open positions.
async fn show_status(config: &Config, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                  SIGNAL HUB STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    match config.bus.backend {
        BusBackend::Redis => {
            let bus = RedisBus::connect(&config.bus.redis_url, 1).await?;
            let mut entries: Vec<_> = bus.get_all().await?.into_values().collect();
            entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));

            println!("\n📡 Published Signals ({})", entries.len());
            for entry in &entries {
                let label = match &entry.admission {
                    signal_hub::bus::Admission::Allowed => "allowed".to_string(),
                    signal_hub::bus::Admission::Blocked { reason } => format!("blocked: {}", reason),
                };
                println!(
                    "   ├─ {:<12} {:<14} [{}] {}",
                    entry.symbol,
                    entry.action(),
                    label,
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                if verbose {
                    if let Some(setup) = entry.decision.setup() {
                        println!(
                            "   │    entry {} stop {} target {} ({:.1}%) {}",
                            setup.entry, setup.stop, setup.target, setup.confidence, setup.rationale
                        );
                    }
                }
            }
        }
        BusBackend::Memory => {
            println!("\n📡 Published Signals");
            println!("   In-process bus: signals are only visible to the running process.");
        }
    }

    if !Path::new(&config.persistence.db_path).exists() {
        println!("\n❌ Database not found: {}", config.persistence.db_path);
        return Ok(());
    }

    let journal = Arc::new(SqliteJournal::new(&config.persistence.db_path)?);
    let admission = AdmissionController::new(config.risk.clone(), journal.clone());
    let state = admission.risk_state().await?;
    let check = admission.can_act().await;

    println!("\n🛡️  Risk");
    println!(
        "   ├─ Daily Loss:   {} / {}",
        state.daily_loss, state.daily_loss_limit
    );
    println!("   ├─ Loss Streak:  {}", state.loss_streak);
    println!("   └─ Admission:    {}", check.reason());

    let open = journal.list_open()?;
    println!("\n🔓 Open Positions ({})", open.len());
    for position in &open {
        println!(
            "   ├─ {:<12} {:<5} size {} [{}] opened {}",
            position.symbol,
            position.action,
            position.size,
            position.group,
            position.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if verbose {
            println!(
                "   │    entry {} stop {} target {}",
                position.entry, position.stop, position.target
            );
        }
    }

    println!();
    Ok(())
}

/// Administrative bus clear.
async fn reset_bus(config: &Config) -> Result<()> {
    match config.bus.backend {
        BusBackend::Redis => {
            let bus = RedisBus::connect(&config.bus.redis_url, 1).await?;
            bus.clear().await?;
            println!("✅ Signal bus cleared");
        }
        BusBackend::Memory => {
            println!("In-process bus: nothing persists between runs, nothing to clear.");
        }
    }
    Ok(())
}

fn close_position(
    config: &Config,
    symbol: &str,
    outcome: PositionStatus,
    pnl: Decimal,
) -> Result<()> {
    let journal = open_journal(&config.persistence.db_path)?;
    if journal.close_position(symbol, outcome, pnl, Utc::now())? {
        println!("✅ {} closed as {} ({})", symbol, outcome, pnl);
    } else {
        println!("❌ No open position for {}", symbol);
    }
    Ok(())
}
