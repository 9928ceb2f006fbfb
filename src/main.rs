use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quotacount::storage::{FaultPoint, StoreFault};
use quotacount::{AdmissionMode, OwnerId, QuotaConfig, QuotaEngine, QuotaError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quotacount", version, about = "Dual-counter quota engine")]
struct Cli {
    /// JSON config file; missing fields use defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent creates and deletes against the in-memory engine and
    /// report whether both counters converged.
    Simulate(SimulateArgs),
    /// Print the effective configuration as JSON.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum AdmissionArg {
    BestEffortRead,
    Transactional,
}

impl From<AdmissionArg> for AdmissionMode {
    fn from(arg: AdmissionArg) -> Self {
        match arg {
            AdmissionArg::BestEffortRead => AdmissionMode::BestEffortRead,
            AdmissionArg::Transactional => AdmissionMode::Transactional,
        }
    }
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 3)]
    owners: usize,

    /// Create attempts per owner.
    #[arg(long, default_value_t = 20)]
    attempts: usize,

    /// Create requests in flight per owner.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Quota per owner; defaults to the configured value.
    #[arg(long)]
    quota: Option<i64>,

    /// Soft-delete every n-th created entity (0 disables deletes).
    #[arg(long, default_value_t = 3)]
    delete_every: usize,

    /// Transient store failures to inject into transactions.
    #[arg(long, default_value_t = 0)]
    transient_faults: u32,

    #[arg(long, value_enum)]
    admission: Option<AdmissionArg>,

    /// Seconds to wait for reconciliation to drain the feed.
    #[arg(long, default_value_t = 5)]
    settle_secs: u64,
}

#[derive(Serialize)]
struct OwnerReport {
    owner_id: String,
    quota_max: i64,
    created: usize,
    denied: usize,
    failed: usize,
    deleted: usize,
    live_entities: usize,
    ledger_count: i64,
    reconciled_count: i64,
    converged: bool,
}

#[derive(Serialize)]
struct SimulationReport {
    admission: AdmissionMode,
    drained: bool,
    owners: Vec<OwnerReport>,
    workers: quotacount::feed::FeedWorkerStats,
    dead_letters: usize,
}

fn load_config(path: Option<&PathBuf>) -> Result<QuotaConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Ok(QuotaConfig::from_json_str(&raw)?)
        }
        None => Ok(QuotaConfig::default()),
    }
}

#[derive(Default)]
struct OwnerTally {
    created: Vec<quotacount::EntityId>,
    denied: usize,
    failed: usize,
}

async fn run_owner(
    engine: Arc<QuotaEngine>,
    owner_id: OwnerId,
    attempts: usize,
    concurrency: usize,
) -> Result<OwnerTally> {
    let mut tally = OwnerTally::default();
    let mut remaining = attempts;

    while remaining > 0 {
        let wave = remaining.min(concurrency.max(1));
        remaining -= wave;

        let handles: Vec<_> = (0..wave)
            .map(|i| {
                let engine = engine.clone();
                let owner_id = owner_id.clone();
                tokio::spawn(async move {
                    engine
                        .service()
                        .create_entity(&owner_id, format!("entity-{}", i))
                        .await
                })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            match joined? {
                Ok(entity) => tally.created.push(entity.id),
                Err(QuotaError::QuotaExceeded { .. }) => tally.denied += 1,
                Err(err) if err.is_retryable() => tally.failed += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(tally)
}

async fn simulate(config: QuotaConfig, args: SimulateArgs) -> Result<SimulationReport> {
    let mut config = config;
    if let Some(admission) = args.admission {
        config = config.admission(admission.into());
    }
    let admission = config.admission;

    let engine = Arc::new(QuotaEngine::start(config)?);
    if args.transient_faults > 0 {
        engine.store().inject_fault(
            FaultPoint::TransactWrite,
            StoreFault::Transient,
            args.transient_faults,
        )?;
    }

    let mut owners = Vec::with_capacity(args.owners);
    for i in 0..args.owners {
        let owner_id = OwnerId::new(format!("owner-{}", i))?;
        engine
            .service()
            .create_owner(owner_id.clone(), args.quota)
            .await?;
        owners.push(owner_id);
    }

    let runs: Vec<_> = owners
        .iter()
        .map(|owner_id| {
            tokio::spawn(run_owner(
                engine.clone(),
                owner_id.clone(),
                args.attempts,
                args.concurrency,
            ))
        })
        .collect();

    let mut tallies = Vec::with_capacity(runs.len());
    for joined in futures::future::join_all(runs).await {
        tallies.push(joined??);
    }

    let mut deleted = vec![0usize; owners.len()];
    if args.delete_every > 0 {
        for (index, (owner_id, tally)) in owners.iter().zip(&tallies).enumerate() {
            for entity_id in tally.created.iter().step_by(args.delete_every) {
                engine.service().delete_entity(owner_id, entity_id).await?;
                deleted[index] += 1;
            }
        }
    }

    let drained = engine.settle(Duration::from_secs(args.settle_secs)).await?;

    let mut reports = Vec::with_capacity(owners.len());
    for (index, (owner_id, tally)) in owners.iter().zip(&tallies).enumerate() {
        let live_entities = engine.service().list_entities(owner_id).await?.len();
        let decision = engine.service().admission(owner_id).await?;
        reports.push(OwnerReport {
            owner_id: owner_id.to_string(),
            quota_max: decision.quota_max,
            created: tally.created.len(),
            denied: tally.denied,
            failed: tally.failed,
            deleted: deleted[index],
            live_entities,
            ledger_count: decision.ledger_count,
            reconciled_count: decision.reconciled_count,
            converged: decision.reconciled_count == live_entities as i64
                && decision.ledger_count == live_entities as i64,
        });
    }

    let dead_letters = engine.dead_letters().len().await;
    let engine = Arc::try_unwrap(engine).map_err(|_| anyhow!("engine still shared at shutdown"))?;
    let workers = engine.shutdown().await?;

    Ok(SimulationReport {
        admission,
        drained,
        owners: reports,
        workers,
        dead_letters,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate(args) => {
            let report = simulate(config, args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.owners.iter().all(|owner| owner.converged) {
                return Err(anyhow!("counters did not converge"));
            }
        }
    }
    Ok(())
}
