//! Variational Omni auto-trader
//!
//! Drives the Variational Omni trading page in a browser: repeated open/close
//! round trips, batches of same-direction orders, and a terminal to control
//! them. Session state survives restarts.

mod automator;
mod bus;
mod cdp;
mod config;
mod coordinator;
mod db;
mod models;
mod presenter;
mod protocol;
mod store;
mod surface;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::automator::SimulatedPage;
use crate::config::{AppConfig, DEFAULT_CDP_ENDPOINT, DEFAULT_DATABASE_URL, DEFAULT_SYMBOL};
use crate::coordinator::{ResumeOutcome, TradingCoordinator};
use crate::db::Database;
use crate::presenter::{render_state, Presenter};
use crate::protocol::Request;
use crate::store::{MemoryStore, SessionStore, StateStore};
use crate::surface::{is_target_url, CdpSurfaceHost, LocalSurfaceHost, SurfaceHost};

const BUS_CAPACITY: usize = 32;
const SIMULATED_PAGE_URL: &str = "https://omni.variational.io/perpetual/BTC";

/// Variational Omni auto-trader CLI.
#[derive(Parser)]
#[command(name = "omnitrader")]
#[command(about = "Automate click-through trading on Variational Omni", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "OMNI_DATABASE", default_value = DEFAULT_DATABASE_URL)]
    database: String,

    /// Browser DevTools endpoint (start the browser with --remote-debugging-port=9222)
    #[arg(long, env = "OMNI_CDP_ENDPOINT", default_value = DEFAULT_CDP_ENDPOINT)]
    cdp_endpoint: String,

    /// Symbol sent with every order
    #[arg(long, env = "OMNI_SYMBOL", default_value = DEFAULT_SYMBOL)]
    symbol: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and the interactive terminal
    Run {
        /// Trade against an in-process simulated page
        #[arg(long)]
        simulate: bool,

        /// Keep session state in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show the persisted session state
    Status,

    /// Show logged trades, newest first
    History {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete the trade history
    ClearHistory,

    /// List browser pages and whether they host the trading interface
    Surfaces,

    /// Check that the trading page answers
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let base = AppConfig {
        database_url: cli.database,
        cdp_endpoint: cli.cdp_endpoint,
        symbol: cli.symbol,
        ..AppConfig::default()
    };

    match cli.command {
        Commands::Run { simulate, ephemeral } => run(base.with_mode(simulate, ephemeral)).await?,

        Commands::Status => {
            let store = open_store(&base).await?;
            let state = store.load().await?;
            println!("\n=== Session ===\n");
            println!("{}", render_state(&state));
            if state.is_trading() {
                println!("\nCycles resume on the next 'omnitrader run' while a trading page is open.");
            }
        }

        Commands::History { limit } => {
            let store = open_store(&base).await?;
            let history = store.history(Some(limit)).await?;

            if history.is_empty() {
                println!("No trades logged yet.");
                return Ok(());
            }

            println!("\n{:<26} {:<32} {}", "TIME", "ID", "DETAILS");
            println!("{}", "-".repeat(90));
            for entry in history {
                let details = serde_json::to_string(&entry.payload)?;
                println!("{:<26} {:<32} {}", entry.timestamp, entry.id, truncate(&details, 60));
            }
        }

        Commands::ClearHistory => {
            let store = open_store(&base).await?;
            store.clear_history().await?;
            println!("Trade history cleared.");
        }

        Commands::Surfaces => {
            let host = CdpSurfaceHost::new(&base.cdp_endpoint)?;
            let surfaces = host.list_surfaces().await?;

            if surfaces.is_empty() {
                println!("No pages open in the browser at {}.", base.cdp_endpoint);
                return Ok(());
            }

            println!("\n{:<34} {:<7} {:<8} {:<30} {}", "ID", "ACTIVE", "TRADING", "TITLE", "URL");
            println!("{}", "-".repeat(110));
            for surface in surfaces {
                println!(
                    "{:<34} {:<7} {:<8} {:<30} {}",
                    surface.id,
                    if surface.active { "yes" } else { "" },
                    if is_target_url(&surface.url) { "yes" } else { "" },
                    truncate(&surface.title, 28),
                    surface.url
                );
            }
        }

        Commands::Ping => {
            let coordinator = build_coordinator(&base).await?;
            let response = coordinator.handle(Request::Ping).await;
            coordinator.shutdown().await;

            if response.success {
                println!("{}", response.summary());
            } else {
                anyhow::bail!("{}", response.summary());
            }
        }
    }

    Ok(())
}

/// Interactive session: resume, serve the bus, run the presenter until quit or Ctrl+C.
async fn run(config: AppConfig) -> Result<()> {
    info!(
        symbol = %config.symbol,
        simulate = config.simulate,
        ephemeral = config.ephemeral,
        "Starting auto-trader"
    );

    let coordinator = build_coordinator(&config).await?;

    println!("\n=== Variational Omni Auto-Trader ===");
    println!("{}", config.describe());
    match coordinator.resume().await {
        ResumeOutcome::Idle => {}
        ResumeOutcome::Resumed => println!("Resumed the previous session."),
        ResumeOutcome::Deferred => println!(
            "The previous session was trading but no trading page is open.\n\
             Open omni.variational.io and start again, or type stop to reset."
        ),
    }
    println!("Press Ctrl+C or type quit to leave.\n");

    let (bus, requests) = bus::channel(BUS_CAPACITY);
    let server = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.serve(requests).await }
    });

    let presenter = Presenter::new(bus, coordinator.subscribe(), &config.symbol, std::io::stdout());
    tokio::select! {
        result = presenter.run(presenter::spawn_stdin_reader()) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    coordinator.shutdown().await;
    server.abort();
    Ok(())
}

async fn build_coordinator(config: &AppConfig) -> Result<TradingCoordinator> {
    let store = open_store(config).await?;
    TradingCoordinator::new(store, surface_host(config)?, config.symbol.as_str()).await
}

async fn open_store(config: &AppConfig) -> Result<StateStore> {
    let backend: Arc<dyn SessionStore> = if config.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(Database::new(&config.database_url).await?)
    };
    Ok(StateStore::new(backend))
}

fn surface_host(config: &AppConfig) -> Result<Arc<dyn SurfaceHost>> {
    if config.simulate {
        let host = LocalSurfaceHost::new();
        host.add_surface("simulated-1", SIMULATED_PAGE_URL, true, Arc::new(SimulatedPage::variational()));
        return Ok(Arc::new(host));
    }
    Ok(Arc::new(CdpSurfaceHost::new(config.cdp_endpoint.as_str())?))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
