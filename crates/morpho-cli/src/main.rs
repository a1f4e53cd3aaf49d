mod actuator;
mod scheduler;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use morpho_core::{
    AuditEvent, AuditRecord, ControlConfig, Controller, DiffusionOperator, Gateway, IntentResult,
    Signal, Topology,
};
use morpho_store::{AuditQuery, AuditStore};

use crate::actuator::SimulatedActuator;
use crate::scheduler::SchedulerOptions;
use crate::telemetry::{Feed, Replay, Scenario, Synthetic, SyntheticOptions};

#[derive(Parser)]
#[command(name = "morpho", about = "Self-healing control loop driver and audit tools")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Audit database (defaults to $MORPHO_DATA_DIR/audit.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop against replayed or synthetic telemetry
    Run(RunArgs),

    /// Validate a configuration file and show derived diffusion coefficients
    CheckConfig {
        /// Configuration file to check
        path: PathBuf,

        /// Topology to derive D from
        #[arg(long)]
        topology: Option<PathBuf>,
    },

    /// List runs recorded in the audit log
    Runs,

    /// Show audit records (latest run by default)
    Audit {
        /// Run id
        #[arg(long)]
        run: Option<Uuid>,

        /// Only records of this kind (detection, vote, intent, alert)
        #[arg(long)]
        kind: Option<String>,

        /// Maximum number of records
        #[arg(long)]
        limit: Option<usize>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Export audit records to a JSONL file
    Export {
        /// Output file path
        path: PathBuf,

        /// Run id (all runs when omitted)
        #[arg(long)]
        run: Option<Uuid>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Topology file (.json or .toml); a ring is generated otherwise
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Ring size when no topology file is given
    #[arg(long, default_value_t = 8)]
    nodes: usize,

    /// JSONL replay file, one batch (or topology change) per line
    #[arg(long, conflicts_with = "scenario")]
    replay: Option<PathBuf>,

    /// Synthetic scenario
    #[arg(long, value_enum, default_value_t = Scenario::Calm)]
    scenario: Scenario,

    /// Node the synthetic fault hits (defaults to the middle node)
    #[arg(long)]
    target: Option<String>,

    /// First tick of the synthetic fault
    #[arg(long, default_value_t = 3)]
    onset: u64,

    /// Seed for synthetic telemetry and failure injection
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Probability that a node's sample goes missing in a tick
    #[arg(long, default_value_t = 0.0)]
    dropout: f64,

    /// Stop after this many ticks
    #[arg(long)]
    ticks: Option<u64>,

    /// Wall-clock milliseconds per tick (0 runs unpaced)
    #[arg(long, default_value_t = 0)]
    tick_ms: u64,

    /// Share of actuator calls that fail
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Simulated actuator latency in milliseconds
    #[arg(long, default_value_t = 0)]
    actuator_latency_ms: u64,

    /// Per-attempt actuation timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    dispatch_timeout_ms: u64,

    /// Telemetry fetch timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    fetch_timeout_ms: u64,

    /// Simulated synthetic fetch latency in milliseconds
    #[arg(long, default_value_t = 0)]
    fetch_delay_ms: u64,

    /// Keep the audit log in memory only
    #[arg(long)]
    no_persist: bool,
}

fn db_path(cli: &Cli) -> PathBuf {
    cli.db
        .clone()
        .unwrap_or_else(|| morpho_store::default_data_dir().join("audit.db"))
}

fn open_store(cli: &Cli) -> Result<AuditStore> {
    let path = db_path(cli);
    AuditStore::open(&path).with_context(|| format!("failed to open audit store {}", path.display()))
}

fn load_config(cli: &Cli) -> Result<ControlConfig> {
    match &cli.config {
        Some(path) => morpho_store::load_config(path)
            .with_context(|| format!("invalid config {}", path.display())),
        None => Ok(ControlConfig::default()),
    }
}

fn load_topology(path: Option<&Path>, nodes: usize) -> Result<Topology> {
    match path {
        Some(path) => morpho_store::load_topology(path)
            .with_context(|| format!("invalid topology {}", path.display())),
        None => {
            if nodes == 0 {
                bail!("--nodes must be at least 1");
            }
            telemetry::ring(nodes)
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args).await,
        Commands::CheckConfig { path, topology } => cmd_check_config(path, topology.as_deref()),
        Commands::Runs => cmd_runs(&cli),
        Commands::Audit {
            run,
            kind,
            limit,
            json,
        } => cmd_audit(&cli, *run, kind.clone(), *limit, *json),
        Commands::Export { path, run } => cmd_export(&cli, path, *run),
    }
}

async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let RunArgs {
        topology,
        nodes,
        replay,
        scenario,
        target,
        onset,
        seed,
        dropout,
        ticks,
        tick_ms,
        failure_rate,
        actuator_latency_ms,
        dispatch_timeout_ms,
        fetch_timeout_ms,
        fetch_delay_ms,
        no_persist,
    } = args;

    if !(0.0..=1.0).contains(failure_rate) || !(0.0..=1.0).contains(dropout) {
        bail!("--failure-rate and --dropout must be within [0, 1]");
    }

    let cfg = load_config(cli)?;
    let topology = Arc::new(load_topology(topology.as_deref(), *nodes)?);

    let feed = match replay {
        Some(path) => Feed::Replay(Replay::open(path)?),
        None => {
            let target = target.as_deref().map(morpho_core::NodeId::from);
            if let Some(t) = &target
                && topology.index_of(t.as_str()).is_none()
            {
                bail!("target node {t} is not in the topology");
            }
            let synthetic = Synthetic::new(
                &topology,
                SyntheticOptions {
                    scenario: *scenario,
                    target,
                    onset: *onset,
                    seed: *seed,
                    dropout: *dropout,
                    fetch_delay: (*fetch_delay_ms > 0)
                        .then(|| Duration::from_millis(*fetch_delay_ms)),
                },
            );
            if *scenario != Scenario::Calm
                && let Some(t) = synthetic.target()
            {
                println!("scenario:   {scenario:?} on {t} from tick {onset}");
            }
            Feed::Synthetic(synthetic)
        }
    };

    let (sink, db): (Box<dyn morpho_core::AuditSink>, Option<PathBuf>) = if *no_persist {
        (Box::new(morpho_core::MemoryAuditSink::new()), None)
    } else {
        (Box::new(open_store(cli)?), Some(db_path(cli)))
    };

    let gateway = Arc::new(Gateway::from_config(&cfg.gateway));
    let controller = Controller::new(cfg, topology, sink).context("failed to start controller")?;
    let run_id = controller.run_id();
    let actuator = Arc::new(SimulatedActuator::new(
        *failure_rate,
        Duration::from_millis(*actuator_latency_ms),
        *seed,
    ));

    let opts = SchedulerOptions {
        max_ticks: *ticks,
        tick_interval: (*tick_ms > 0).then(|| Duration::from_millis(*tick_ms)),
        fetch_timeout: Duration::from_millis(*fetch_timeout_ms),
        dispatch_timeout: Duration::from_millis(*dispatch_timeout_ms),
    };
    let (_controller, stats) =
        scheduler::run(controller, feed, gateway, actuator.clone(), opts).await?;

    println!("run:        {run_id}");
    println!("ticks:      {}", stats.ticks);
    println!("admitted:   {}", stats.admitted);
    println!("rejected:   {}", stats.rejected);
    println!("succeeded:  {}", stats.succeeded);
    println!("failed:     {}", stats.failed);
    println!("stale:      {} ticks", stats.stale_ticks);
    if stats.fetch_timeouts > 0 {
        println!("timeouts:   {} fetches", stats.fetch_timeouts);
    }
    if stats.topology_changes > 0 {
        println!("topology:   {} changes", stats.topology_changes);
    }
    println!(
        "actuator:   {} calls, {} injected failures",
        actuator.calls(),
        actuator.failures()
    );
    if let Some(db) = db {
        println!("audit:      {}", db.display());
    }
    Ok(())
}

fn cmd_check_config(path: &Path, topology: Option<&Path>) -> Result<()> {
    let cfg = morpho_store::load_config(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!("config ok: {}", path.display());

    if let Some(topo_path) = topology {
        let topo = load_topology(Some(topo_path), 0)?;
        let op = DiffusionOperator::build(&topo, &cfg.field, cfg.tick_seconds)
            .context("diffusion is unstable on this topology")?;
        println!("deg_max:    {}", op.deg_max());
        for signal in Signal::ALL {
            println!("D[{signal}]: {:.6}", op.coefficient(signal));
        }
    }
    Ok(())
}

fn cmd_runs(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let runs = store.runs().context("failed to list runs")?;
    if runs.is_empty() {
        println!("(no runs recorded)");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {}  ticks {}..{}  {} records",
            run.run_id, run.started_at, run.first_tick, run.last_tick, run.records
        );
    }
    Ok(())
}

fn describe(record: &AuditRecord) -> String {
    match &record.event {
        AuditEvent::Detection { transition: t } => format!(
            "{} {} {:?} -> {:?} ({:.4} vs {:.4})",
            t.node, t.signal, t.from, t.to, t.value, t.threshold
        ),
        AuditEvent::Vote { vote } => format!(
            "{} {} ({}/{} hot) {}",
            vote.node,
            if vote.approved { "approved" } else { "not approved" },
            vote.hot_neighbors,
            vote.degree,
            vote.reason
        ),
        AuditEvent::Intent { intent, result, .. } => {
            let status = match result {
                IntentResult::Pending => "pending".to_string(),
                IntentResult::Succeeded => "succeeded".to_string(),
                IntentResult::Failed { reason } => format!("failed: {reason}"),
                IntentResult::Rejected { rejection } => format!("rejected: {rejection}"),
            };
            format!(
                "{} {} [{status}] {}",
                intent.action.action_type(),
                intent.action.target(),
                intent.trigger_reason
            )
        }
        AuditEvent::Alert {
            severity, message, ..
        } => format!("[{severity}] {message}"),
    }
}

fn cmd_audit(
    cli: &Cli,
    run: Option<Uuid>,
    kind: Option<String>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let store = open_store(cli)?;
    let run = match run {
        Some(run) => Some(run),
        None => store.latest_run().context("failed to find latest run")?,
    };
    let Some(run_id) = run else {
        println!("(no runs recorded)");
        return Ok(());
    };

    let query = AuditQuery {
        kind,
        limit,
        ..AuditQuery::run(run_id)
    };
    let records = store.records(&query).context("failed to read audit log")?;
    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!(
                "{:>5} t={:<5} {:<9} {:<9} {}",
                record.seq,
                record.tick,
                record.event.kind(),
                record.agent.map_or("-", |a| a.name()),
                describe(record)
            );
        }
    }
    if !json {
        eprintln!("{} records from run {run_id}", records.len());
    }
    Ok(())
}

fn cmd_export(cli: &Cli, path: &Path, run: Option<Uuid>) -> Result<()> {
    let store = open_store(cli)?;
    let query = AuditQuery {
        run_id: run,
        ..AuditQuery::default()
    };
    let n = store
        .export_jsonl_file(&query, path)
        .with_context(|| format!("failed to export to {}", path.display()))?;
    println!("exported {n} records to {}", path.display());
    Ok(())
}
