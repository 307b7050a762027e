//! Sanad Trader: headless trading workers.
//!
//! One subcommand per worker; an external cron dispatcher schedules them.
//! Every worker builds its own runtime context, writes a lease for the
//! watchdog, runs one cycle and exits.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use sanad_trader::application::cold_path::ColdPathWorker;
use sanad_trader::application::context::RuntimeContext;
use sanad_trader::application::heartbeat::Heartbeat;
use sanad_trader::application::monitor::PositionMonitor;
use sanad_trader::application::oms::OrderManager;
use sanad_trader::application::policy::{PolicyState, evaluate_gates};
use sanad_trader::application::router::SignalRouter;
use sanad_trader::application::watchdog::Watchdog;
use sanad_trader::config::Config;
use sanad_trader::domain::decision::DecisionPacket;
use sanad_trader::infrastructure::core::circuit_breaker::CircuitBreakerPool;
use sanad_trader::infrastructure::core::http_client_factory::HttpClientFactory;
use sanad_trader::infrastructure::flags::{FlagFile, KillSwitch};
use sanad_trader::infrastructure::leases::LeaseWriter;
use sanad_trader::infrastructure::llm::HttpLlmOracle;
use sanad_trader::infrastructure::notify::OutboxNotifier;
use sanad_trader::infrastructure::paper_execution::PaperExchange;
use sanad_trader::infrastructure::persistence::{Database, StateStore};

#[derive(Parser)]
#[command(name = "sanad-trader", version, about = "Autonomous signal-to-execution trading agent")]
struct Cli {
    /// Path to the thresholds document
    #[arg(long, default_value = "config/thresholds.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one worker cycle
    Run {
        #[command(subcommand)]
        worker: Worker,
    },
    /// Evaluate the policy gates against a decision packet file
    PolicyCheck { packet: PathBuf },
}

#[derive(Subcommand)]
enum Worker {
    /// Signal router: select the best candidate and feed the pipeline
    Router,
    /// Position monitor: evaluate exit rules on open positions
    Monitor,
    /// Cold-path analysis queue worker
    ColdPath,
    /// Health checks with emergency overrides
    Heartbeat,
    /// Tiered self-healing for stalled components
    Watchdog,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    info!(
        "Sanad Trader {} starting (mode={:?}, policy={})",
        env!("CARGO_PKG_VERSION"),
        config.mode,
        config.policy_version
    );

    match cli.command {
        Command::Run { worker } => run_worker(config, worker).await,
        Command::PolicyCheck { packet } => policy_check(config, &packet).await,
    }
}

async fn build_context(config: Config) -> Result<RuntimeContext> {
    let database = Database::new(&config.database_url).await?;
    let store = StateStore::new(database);

    let kill_switch = KillSwitch::new(&config.kill_switch_path());
    let pause_flag = FlagFile::new(&config.pause_flag_path());
    let fast_path_flag = FlagFile::new(&config.fast_path_flag_path());

    let breakers = CircuitBreakerPool::load(
        &config.state_dir().join("circuit_breakers.json"),
        config.circuit_breakers.clone(),
    );

    let endpoint = std::env::var("LLM_GATEWAY_URL")
        .context("LLM_GATEWAY_URL must be set (the inference gateway endpoint)")?;
    let oracle = Arc::new(HttpLlmOracle::new(
        HttpClientFactory::create_client(),
        endpoint,
        Duration::from_secs(config.cold_path.timeout_seconds),
    ));

    if !config.mode.is_paper() {
        bail!("live mode requires a live exchange client; this build wires the paper exchange only");
    }
    let exchange = Arc::new(PaperExchange::new(config.state_dir()));

    let notifier = Arc::new(OutboxNotifier::new(config.logs_dir()));

    Ok(RuntimeContext {
        config,
        store,
        kill_switch,
        pause_flag,
        fast_path_flag,
        breakers: tokio::sync::Mutex::new(breakers),
        oracle,
        exchange,
        notifier,
    })
}

async fn run_worker(config: Config, worker: Worker) -> Result<()> {
    let leases_dir = config.leases_dir();
    let ctx = build_context(config).await?;
    let now = Utc::now();

    let (name, ttl) = match worker {
        Worker::Router => ("signal_router", 2700),
        Worker::Monitor => ("position_monitor", 1200),
        Worker::ColdPath => ("cold_path", 3600),
        Worker::Heartbeat => ("heartbeat", 900),
        Worker::Watchdog => ("watchdog", 900),
    };
    let lease = LeaseWriter::begin(&leases_dir, name, ttl, now)?;

    let outcome = match worker {
        Worker::Router => SignalRouter::new(&ctx).run_cycle(now).await,
        Worker::Monitor => {
            let oms = OrderManager::new(ctx.store.clone(), ctx.exchange.clone(), ctx.kill_switch.clone());
            let monitor = PositionMonitor::new(ctx.config.clone(), ctx.store.clone(), oms, ctx.notifier.clone());
            monitor.run_cycle(now).await.map(|closed| {
                info!("Monitor cycle complete: {closed} positions closed");
            })
        }
        Worker::ColdPath => {
            let worker = ColdPathWorker::new(ctx.config.clone(), ctx.store.clone(), ctx.oracle.clone())?;
            worker.run_cycle(now).await.map(|processed| {
                info!("Cold path cycle complete: {processed} tasks processed");
            })
        }
        Worker::Heartbeat => Heartbeat::new(&ctx).run_cycle(now).await.map(|results| {
            info!("Heartbeat complete: {} checks", results.len());
        }),
        Worker::Watchdog => Watchdog::new(&ctx).run_cycle(now).await,
    };

    lease.complete(Utc::now())?;
    outcome
}

/// Standalone gate evaluation. Exit code: 0 = PASS, 1 = BLOCK, 2 = input error.
async fn policy_check(config: Config, packet_path: &PathBuf) -> Result<()> {
    let raw = match std::fs::read_to_string(packet_path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Cannot read decision packet: {e}");
            std::process::exit(2);
        }
    };
    let packet: DecisionPacket = match serde_json::from_str(&raw) {
        Ok(packet) => packet,
        Err(e) => {
            eprintln!("Cannot parse decision packet: {e}");
            std::process::exit(2);
        }
    };

    let kill_switch = KillSwitch::new(&config.kill_switch_path());
    let state = match PolicyState::load(&config.state_dir(), &kill_switch, None, config.mode.is_paper()) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Cannot load policy state: {e}");
            std::process::exit(2);
        }
    };

    let outcome = evaluate_gates(&config, &packet, &state, Utc::now());
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    std::process::exit(if outcome.passed() { 0 } else { 1 });
}
