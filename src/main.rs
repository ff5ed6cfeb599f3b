use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinSet;
use tracing::{error, info};

use changeflow::archive::{Archive, SledArchive};
use changeflow::config::{Backend, Config, DEFAULT_CONFIG_PATH};
use changeflow::coordinator::Coordinator;
use changeflow::evaluator::Evaluator;
use changeflow::gateway::http::{self, AppState};
use changeflow::gateway::Gateway;
use changeflow::llm::{LanguageService, LlmPool};
use changeflow::solver::Solver;
use changeflow::substrate::Substrate;
use changeflow::telemetry;
use changeflow::tracker::{HttpTracker, TicketingService};

/// Documentation change coordination service.
#[derive(Parser)]
#[command(name = "changeflow", version, about = "Documentation change coordination service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, env = "CHANGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every component in one process
    Serve,
    /// Run the change ingestion coordinator
    Coordinator,
    /// Run one solver worker
    Solver {
        /// Style this worker solves in
        #[arg(long)]
        style: String,
    },
    /// Run the fan-in evaluator
    Evaluator,
    /// Run the HTTP/WebSocket gateway
    Gateway,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let explicit = cli.config.is_some();
    let path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&path, explicit)
        .with_context(|| format!("loading {}", path.display()))?;
    telemetry::init_logging(config.logging.format);
    let metrics = telemetry::init_metrics();

    let standalone = !matches!(cli.command, Commands::Serve);
    if standalone && config.substrate.backend == Backend::Memory {
        bail!("single-component commands need substrate.backend: redis");
    }
    let substrate = connect(&config).await?;

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    match cli.command {
        Commands::Serve => {
            let llm = language(&config)?;
            let tracker = ticketing(&config)?;
            let archive = archive(&config)?;
            spawn_coordinator(&mut tasks, &config, &substrate, &llm, &tracker, &archive);
            for style in &config.solver.styles {
                spawn_solver(&mut tasks, &config, &substrate, &llm, &tracker, style);
            }
            spawn_evaluator(&mut tasks, &config, &substrate, &llm, &tracker);
            spawn_gateway(&mut tasks, &config, &substrate, archive, metrics).await?;
        }
        Commands::Coordinator => {
            let archive = archive(&config)?;
            spawn_coordinator(
                &mut tasks,
                &config,
                &substrate,
                &language(&config)?,
                &ticketing(&config)?,
                &archive,
            );
        }
        Commands::Solver { style } => {
            spawn_solver(
                &mut tasks,
                &config,
                &substrate,
                &language(&config)?,
                &ticketing(&config)?,
                &style,
            );
        }
        Commands::Evaluator => {
            spawn_evaluator(
                &mut tasks,
                &config,
                &substrate,
                &language(&config)?,
                &ticketing(&config)?,
            );
        }
        Commands::Gateway => {
            spawn_gateway(&mut tasks, &config, &substrate, archive(&config)?, metrics).await?;
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => info!("component stopped"),
            Ok(Err(e)) => error!(error = %e, "component failed"),
            Err(e) => error!(error = %e, "component panicked"),
        },
    }
    tasks.shutdown().await;
    Ok(())
}

async fn connect(config: &Config) -> Result<Substrate> {
    match config.substrate.backend {
        Backend::Memory => Ok(Substrate::in_memory()),
        Backend::Redis => Substrate::connect_redis(&config.substrate.redis_url)
            .await
            .with_context(|| format!("connecting to {}", config.substrate.redis_url)),
    }
}

fn language(config: &Config) -> Result<Arc<dyn LanguageService>> {
    let pool = LlmPool::from_env(
        &config.llm.model,
        config.llm.max_tokens,
        config.llm.base_url.as_deref(),
    )?;
    info!(model = pool.model(), "language service ready");
    Ok(Arc::new(pool))
}

fn ticketing(config: &Config) -> Result<Arc<dyn TicketingService>> {
    Ok(Arc::new(HttpTracker::from_env(
        &config.tracker.base_url,
        &config.tracker.queue,
    )?))
}

fn archive(config: &Config) -> Result<Arc<dyn Archive>> {
    let archive = SledArchive::open(&config.archive.path)
        .with_context(|| format!("opening archive at {}", config.archive.path.display()))?;
    Ok(Arc::new(archive))
}

fn spawn_coordinator(
    tasks: &mut JoinSet<Result<()>>,
    config: &Config,
    substrate: &Substrate,
    llm: &Arc<dyn LanguageService>,
    tracker: &Arc<dyn TicketingService>,
    archive: &Arc<dyn Archive>,
) {
    let coordinator = Coordinator::new(
        substrate.clone(),
        llm.clone(),
        tracker.clone(),
        archive.clone(),
        config.coordinator_options(),
    );
    tasks.spawn(async move { Ok(coordinator.run().await?) });
}

fn spawn_solver(
    tasks: &mut JoinSet<Result<()>>,
    config: &Config,
    substrate: &Substrate,
    llm: &Arc<dyn LanguageService>,
    tracker: &Arc<dyn TicketingService>,
    style: &str,
) {
    let solver = Solver::new(
        substrate.clone(),
        llm.clone(),
        tracker.clone(),
        config.solver_options(style),
    );
    tasks.spawn(async move { Ok(solver.run().await?) });
}

fn spawn_evaluator(
    tasks: &mut JoinSet<Result<()>>,
    config: &Config,
    substrate: &Substrate,
    llm: &Arc<dyn LanguageService>,
    tracker: &Arc<dyn TicketingService>,
) {
    let evaluator = Evaluator::new(
        substrate.clone(),
        llm.clone(),
        tracker.clone(),
        config.evaluator_options(),
    );
    tasks.spawn(async move { Ok(evaluator.run().await?) });
}

async fn spawn_gateway(
    tasks: &mut JoinSet<Result<()>>,
    config: &Config,
    substrate: &Substrate,
    archive: Arc<dyn Archive>,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let gateway = Gateway::start(substrate.clone()).await?;
    let state = Arc::new(AppState {
        gateway,
        archive,
        metrics,
    });
    let bind = config.gateway.bind;
    tasks.spawn(async move {
        http::serve(bind, state)
            .await
            .with_context(|| format!("serving on {bind}"))
    });
    Ok(())
}
