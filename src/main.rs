//! Swap cycle engine CLI
//!
//! Command-line interface for running and inspecting agent cycles.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use swap_cycles::chain::SolanaRpcClient;
use swap_cycles::cycle::CycleDeps;
use swap_cycles::swap::SwapService;
use swap_cycles::tokens;
use swap_cycles::wallet::EnvKeyring;
use swap_cycles::{
    Config, CycleEvent, CycleStateStore, CycleSupervisor, Error, InMemoryConfigSource,
    JsonFileStateStore, JupiterApi, Result, RpcConfig, SwapClient, Swapper,
};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "swap-cycles")]
#[command(about = "Autonomous buy/hold/sell cycles on Solana via Jupiter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured agent until Ctrl-C
    Run {
        /// Only start the agents of this owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Show the persisted state of an agent (all agents if omitted)
    Status {
        #[arg(short, long)]
        agent: Option<String>,
    },

    /// Clear a failed or stopped agent back to idle
    Reset {
        #[arg(short, long)]
        agent: String,
    },

    /// Get a swap quote from Jupiter
    Quote {
        /// Input mint (defaults to wrapped SOL)
        #[arg(long, default_value = tokens::mints::WSOL)]
        input: String,

        /// Output mint
        #[arg(long)]
        output: String,

        /// Amount in the input token's base units
        #[arg(long)]
        amount: u64,

        /// Slippage tolerance in basis points
        #[arg(long, default_value_t = swap_cycles::config::DEFAULT_SLIPPAGE_BPS)]
        slippage_bps: u16,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config {
            rpc: RpcConfig::from_env(),
            ..Config::default()
        },
    };

    match cli.command {
        Commands::Run { owner } => run(config, owner).await?,
        Commands::Status { agent } => show_status(&config, agent).await?,
        Commands::Reset { agent } => reset(config, &agent).await?,
        Commands::Quote {
            input,
            output,
            amount,
            slippage_bps,
        } => quote(&config, &input, &output, amount, slippage_bps).await?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn build_supervisor(config: &Config) -> Result<(CycleSupervisor, mpsc::UnboundedReceiver<CycleEvent>)> {
    let chain = Arc::new(SolanaRpcClient::new(&config.rpc)?);
    let service: Arc<dyn SwapService> = Arc::new(JupiterApi::new(&config.swap)?);
    let swapper = Arc::new(SwapClient::from_config(
        service,
        chain.clone(),
        &config.swap,
        &config.cycle,
    ));
    let (events, receiver) = mpsc::unbounded_channel();

    let deps = CycleDeps {
        swapper,
        chain,
        store: Arc::new(JsonFileStateStore::new(&config.state_dir)),
        configs: Arc::new(InMemoryConfigSource::new(config.agents.clone())),
        timing: config.cycle.clone(),
        events,
    };
    Ok((CycleSupervisor::new(deps, Arc::new(EnvKeyring::new())), receiver))
}

async fn run(config: Config, owner: Option<String>) -> Result<()> {
    if config.agents.is_empty() {
        return Err(Error::Config("no agents configured".to_string()));
    }
    tracing::info!(
        agents = config.agents.len(),
        rpc = %config.rpc.url,
        state_dir = %config.state_dir.display(),
        "Starting swap cycles"
    );

    let (supervisor, mut events) = build_supervisor(&config)?;

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                agent_id = %event.agent_id,
                from = %event.from,
                to = %event.to,
                signature = event.signature.as_deref().unwrap_or(""),
                failures = event.consecutive_failures,
                error = event.last_error.as_deref().unwrap_or(""),
                "Cycle event"
            );
        }
    });

    let owners: Vec<String> = match owner {
        Some(owner) => vec![owner],
        None => {
            let mut owners: Vec<String> = config.agents.iter().map(|a| a.owner.clone()).collect();
            owners.sort();
            owners.dedup();
            owners
        }
    };
    for owner in &owners {
        for (agent_id, report) in supervisor.start_owner(owner).await? {
            match report {
                Ok(report) => tracing::info!(
                    agent_id = %agent_id,
                    phase = %report.state().phase,
                    spawned = report.spawned(),
                    "Start requested"
                ),
                Err(e) => tracing::error!(agent_id = %agent_id, error = %e, "Could not start agent"),
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for in-flight swaps");

    for state in supervisor.stop_all().await {
        tracing::info!(
            agent_id = %state.agent_id,
            phase = %state.phase,
            purchased = state.purchased_amount,
            completed_cycles = state.completed_cycles,
            "Agent stopped"
        );
    }
    drop(supervisor);
    event_log.abort();
    Ok(())
}

async fn show_status(config: &Config, agent: Option<String>) -> Result<()> {
    let store = JsonFileStateStore::new(&config.state_dir);
    let ids = match agent {
        Some(agent) => vec![agent],
        None => store.agent_ids().await?,
    };

    let mut states = Vec::with_capacity(ids.len());
    for id in &ids {
        match store.load(id).await? {
            Some(state) => states.push(state),
            None => return Err(Error::UnknownAgent(id.clone())),
        }
    }
    println!("{}", serde_json::to_string_pretty(&states)?);
    Ok(())
}

async fn reset(config: Config, agent: &str) -> Result<()> {
    let (supervisor, _events) = build_supervisor(&config)?;
    let state = supervisor.reset(agent).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn quote(
    config: &Config,
    input: &str,
    output: &str,
    amount: u64,
    slippage_bps: u16,
) -> Result<()> {
    let chain = Arc::new(SolanaRpcClient::new(&config.rpc)?);
    let service: Arc<dyn SwapService> = Arc::new(JupiterApi::new(&config.swap)?);
    let client = SwapClient::from_config(service, chain, &config.swap, &config.cycle);

    let quote = client.get_quote(input, output, amount, slippage_bps).await?;
    let summary = serde_json::json!({
        "input": tokens::display_symbol(&quote.input_mint),
        "output": tokens::display_symbol(&quote.output_mint),
        "in_amount": quote.in_amount,
        "out_amount": quote.out_amount,
        "min_out_amount": quote.min_out_amount,
        "price_impact_pct": quote.price_impact_pct,
        "route": quote.route_labels,
        "slippage_bps": quote.slippage_bps,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
