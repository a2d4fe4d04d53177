//! ForgeFlow: the durable-state and resilience core of a local-first
//! agentic workflow runtime.
//!
//! **All state is JSON on local disk; every mutation is journaled, audited,
//! and sequenced.**
//!
//! # Core Principles
//!
//! - **Local-first**: one store root, no hidden database
//! - **Single-writer**: mutations serialize through an advisory lock with
//!   stale-owner stealing
//! - **Crash-safe**: a mirrored write-ahead journal precedes every document
//!   write
//! - **Tamper-evident**: domain events land in a SHA-256 hash chain and a
//!   monotonic idempotency-keyed ledger
//! - **Failure-isolated**: provider calls run behind retry, circuit
//!   breakers, graceful degradation, and a dead-letter queue
//!
//! # The Mutation Corridor
//!
//! Every mutating operation follows one path:
//!
//! ```text
//! lock -> guard (safe mode) -> schema validation ->
//! WAL intent (mirrored, fsync) -> document write (fsync) ->
//! audit chain -> event ledger -> release
//! ```
//!
//! Observers of the journals may see intents without effects; observers of
//! the audit chain and ledger never see effects without intents.
//!
//! # Crate Structure
//!
//! - [`core`]: durability primitives and lifecycle records
//! - [`context`]: the scored repository of knowledge maps
//! - [`resilience`]: retry, breakers, DLQ, degradation, health checks,
//!   and the provider façade

pub mod context;
pub mod core;
pub mod resilience;

use crate::context::repo::{ListFilter, MapRepository, MapStatus};
use crate::context::score::ScoreHint;
use crate::core::audit::AuditChain;
use crate::core::cancel::CancelToken;
use crate::core::config::CoreConfig;
use crate::core::error::ForgeFlowError;
use crate::core::health::HealthMesh;
use crate::core::incident::{Incidents, Severity};
use crate::core::ledger::EventLedger;
use crate::core::lock::TransactionLock;
use crate::core::run::{RunState, Runs};
use crate::core::schemas::{self, SchemaValidator};
use crate::core::store::Store;
use crate::core::wal::Wal;
use crate::resilience::breaker::{BreakerConfig, BreakerRegistry};
use crate::resilience::degradation::DegradationManager;
use crate::resilience::dlq::{DeadLetterQueue, DlqFilter, DlqStatus};
use crate::resilience::provider::{Provider, ResilientWrapper};
use crate::resilience::retry::RetryConfig;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::time::Duration;

/// The process-wide core: one value owning every shared subsystem.
///
/// Construct once at startup with [`Core::open`] and pass by reference;
/// subsystem accessors hand out lightweight views. There is no global state
/// behind this value.
#[derive(Debug)]
pub struct Core {
    config: CoreConfig,
    store: Store,
    validator: SchemaValidator,
    mesh: HealthMesh,
    breakers: BreakerRegistry,
    degradation: DegradationManager,
    cancel: CancelToken,
}

impl Core {
    /// Open (creating if needed) the store at `config.root`: lay out the
    /// directory tree, seed default schemas, compile the validator, and
    /// verify the write-ahead journal mirror. Mirror divergence is fatal
    /// here; pending intents are surfaced via the log and left for an
    /// explicit [`Wal::recover`].
    pub fn open(config: CoreConfig) -> Result<Self, ForgeFlowError> {
        let store = Store::new(&config.root);
        store.ensure_layout()?;
        schemas::ensure_default_schemas(&store)?;
        let validator = SchemaValidator::load(&store)?;

        let wal = Wal::new(&store);
        wal.verify_mirror()?;
        let pending: Vec<crate::core::wal::WalEntry> =
            crate::core::fsio::read_jsonl(&store.wal_path())?;
        if !pending.is_empty() {
            tracing::warn!(
                count = pending.len(),
                "store has pending write intents; run `forgeflow wal recover`"
            );
        }

        let mesh = HealthMesh::new(&store);
        let breakers = BreakerRegistry::new(BreakerConfig::from(&config.breaker));
        let degradation = DegradationManager::new(config.flags.clone());
        Ok(Self {
            config,
            store,
            validator,
            mesh,
            breakers,
            degradation,
            cancel: CancelToken::new(),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    pub fn mesh(&self) -> &HealthMesh {
        &self.mesh
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.degradation
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn runs(&self) -> Runs<'_> {
        Runs::new(&self.store, &self.validator, &self.mesh, &self.config)
    }

    pub fn incidents(&self) -> Incidents<'_> {
        Incidents::new(&self.store, &self.validator)
    }

    pub fn maps(&self) -> MapRepository<'_> {
        MapRepository::new(&self.store, &self.validator, &self.mesh)
    }

    pub fn dlq(&self) -> DeadLetterQueue<'_> {
        DeadLetterQueue::new(&self.store, &self.validator)
    }

    /// Wrap a provider in the resilience façade, wired to this core's
    /// breaker registry, health mesh, retry defaults, and dead-letter
    /// queue.
    pub fn wrap_provider(&self, provider: std::sync::Arc<dyn Provider>) -> ResilientWrapper<'_> {
        ResilientWrapper::new(
            provider,
            &self.breakers,
            &self.mesh,
            RetryConfig::from(&self.config.retry),
            self.cancel.clone(),
        )
        .with_dlq(DeadLetterQueue::new(&self.store, &self.validator))
    }

    pub fn wal(&self) -> Wal {
        Wal::new(&self.store)
    }

    pub fn audit(&self) -> AuditChain {
        AuditChain::new(&self.store)
    }

    pub fn ledger(&self) -> EventLedger {
        EventLedger::new(&self.store)
    }
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[clap(
    name = "forgeflow",
    version = env!("CARGO_PKG_VERSION"),
    about = "Durable-state and resilience core for local-first agentic workflows",
    disable_version_flag = true
)]
pub struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the store layout and seed default schemas
    Init,
    /// Run lifecycle: start, note, finish
    Run(RunCli),
    /// Incident lifecycle: open, note, resolve
    Incident(IncidentCli),
    /// Context maps: upsert, get, list, top, delete
    Map(MapCli),
    /// Dead-letter queue: list, show, stats, delete
    Dlq(DlqCli),
    /// Write-ahead journal maintenance
    Wal(WalCli),
    /// Audit chain verification
    Audit(AuditCli),
    /// Health mesh posture
    Health(HealthCli),
}

#[derive(clap::Args, Debug)]
struct RunCli {
    #[clap(subcommand)]
    command: RunCommand,
}

#[derive(Subcommand, Debug)]
enum RunCommand {
    /// Start a run (acquires the transaction lock)
    Start {
        /// Run payload as inline JSON
        #[clap(long, default_value = "{}")]
        payload: String,
        /// Seconds to wait for the transaction lock
        #[clap(long, default_value = "30")]
        max_wait: u64,
    },
    /// Append a note to the executing run
    Note {
        #[clap(long)]
        id: String,
        #[clap(long)]
        content: String,
    },
    /// Finish a run and release the lock
    Finish {
        #[clap(long)]
        id: String,
        /// Outcome: succeeded, failed, or partially_succeeded
        #[clap(long)]
        outcome: String,
    },
    /// List runs
    List,
}

#[derive(clap::Args, Debug)]
struct IncidentCli {
    #[clap(subcommand)]
    command: IncidentCommand,
}

#[derive(Subcommand, Debug)]
enum IncidentCommand {
    /// Open an incident
    Open {
        /// Severity: low, medium, high, critical
        #[clap(long, default_value = "medium")]
        severity: String,
        #[clap(long)]
        summary: String,
    },
    /// Append a note
    Note {
        #[clap(long)]
        id: String,
        #[clap(long)]
        content: String,
    },
    /// Link a context map
    LinkMap {
        #[clap(long)]
        id: String,
        #[clap(long)]
        map: String,
    },
    /// Resolve an incident
    Resolve {
        #[clap(long)]
        id: String,
        /// Optional root-cause analysis
        #[clap(long)]
        rca: Option<String>,
    },
    /// List incidents
    List,
}

#[derive(clap::Args, Debug)]
struct MapCli {
    #[clap(subcommand)]
    command: MapCommand,
}

#[derive(Subcommand, Debug)]
enum MapCommand {
    /// Create or update a map (takes the lock for the write)
    Upsert {
        #[clap(long)]
        id: String,
        /// Map fields as inline JSON
        #[clap(long, default_value = "{}")]
        data: String,
    },
    /// Read one map
    Get {
        #[clap(long)]
        id: String,
    },
    /// List map metadata
    List {
        /// Filter by status: draft, active, archived, deleted
        #[clap(long)]
        status: Option<String>,
        /// Filter by tag
        #[clap(long)]
        tag: Option<String>,
    },
    /// Top maps for a hint
    Top {
        /// Comma-separated hint tags
        #[clap(long, default_value = "")]
        tags: String,
        #[clap(long, default_value = "5")]
        limit: usize,
    },
    /// Logically delete a map
    Delete {
        #[clap(long)]
        id: String,
    },
}

#[derive(clap::Args, Debug)]
struct DlqCli {
    #[clap(subcommand)]
    command: DlqCommand,
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List entries
    List {
        /// Filter by verb
        #[clap(long)]
        verb: Option<String>,
        /// Filter by status: failed, in_progress, resolved
        #[clap(long)]
        status: Option<String>,
    },
    /// Show one entry
    Show {
        #[clap(long)]
        id: String,
    },
    /// Aggregate statistics
    Stats,
    /// Delete an entry
    Delete {
        #[clap(long)]
        id: String,
    },
}

#[derive(clap::Args, Debug)]
struct WalCli {
    #[clap(subcommand)]
    command: WalCommand,
}

#[derive(Subcommand, Debug)]
enum WalCommand {
    /// Verify the journal mirror, report pending intents, truncate
    Recover,
    /// Verify the journal mirror only
    Verify,
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    #[clap(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Recompute the hash chain and report the first divergence
    Verify,
}

#[derive(clap::Args, Debug)]
struct HealthCli {
    #[clap(subcommand)]
    command: HealthCommand,
}

#[derive(Subcommand, Debug)]
enum HealthCommand {
    /// Show the current health record
    Status,
    /// Reset the violation-warning counter
    ResetWarnings,
}

/// Parse and dispatch a CLI invocation against the configured store.
pub fn run_cli(cli: Cli) -> Result<(), ForgeFlowError> {
    let config = CoreConfig::load(std::path::Path::new("."))?;
    let core = Core::open(config)?;
    dispatch(&core, cli.command)
}

fn dispatch(core: &Core, command: Command) -> Result<(), ForgeFlowError> {
    match command {
        Command::Init => {
            // `Core::open` already laid everything out.
            println!(
                "{} store initialized at {}",
                "ok".green(),
                core.store().root().display()
            );
            Ok(())
        }
        Command::Run(cli) => run_run_cli(core, cli),
        Command::Incident(cli) => run_incident_cli(core, cli),
        Command::Map(cli) => run_map_cli(core, cli),
        Command::Dlq(cli) => run_dlq_cli(core, cli),
        Command::Wal(cli) => run_wal_cli(core, cli),
        Command::Audit(cli) => run_audit_cli(core, cli),
        Command::Health(cli) => run_health_cli(core, cli),
    }
}

fn run_run_cli(core: &Core, cli: RunCli) -> Result<(), ForgeFlowError> {
    match cli.command {
        RunCommand::Start { payload, max_wait } => {
            let payload = serde_json::from_str(&payload)?;
            let run = core.runs().start(
                payload,
                Duration::from_secs(max_wait),
                core.cancel_token(),
            )?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunCommand::Note { id, content } => {
            let run = core.runs().note(&id, &content)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunCommand::Finish { id, outcome } => {
            let outcome = parse_run_outcome(&outcome)?;
            let run = core.runs().finish(&id, outcome)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        RunCommand::List => {
            for run in core.runs().list()? {
                println!(
                    "{}  {}  started {}",
                    run.id,
                    format!("{:?}", run.state).to_lowercase(),
                    run.started_at
                );
            }
        }
    }
    Ok(())
}

fn run_incident_cli(core: &Core, cli: IncidentCli) -> Result<(), ForgeFlowError> {
    let incidents = core.incidents();
    match cli.command {
        IncidentCommand::Open { severity, summary } => {
            let severity = parse_severity(&severity)?;
            let incident = incidents.open(severity, &summary)?;
            println!("{}", serde_json::to_string_pretty(&incident)?);
        }
        IncidentCommand::Note { id, content } => {
            let incident = incidents.note(&id, &content)?;
            println!("{}", serde_json::to_string_pretty(&incident)?);
        }
        IncidentCommand::LinkMap { id, map } => {
            let incident = incidents.link_map(&id, &map)?;
            println!("{}", serde_json::to_string_pretty(&incident)?);
        }
        IncidentCommand::Resolve { id, rca } => {
            let incident = incidents.resolve(&id, rca.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&incident)?);
        }
        IncidentCommand::List => {
            for incident in incidents.list()? {
                let status = match incident.status {
                    crate::core::incident::IncidentStatus::Open => "open".red().to_string(),
                    crate::core::incident::IncidentStatus::Resolved => {
                        "resolved".green().to_string()
                    }
                };
                println!("{}  {}  {}", incident.id, status, incident.summary);
            }
        }
    }
    Ok(())
}

fn run_map_cli(core: &Core, cli: MapCli) -> Result<(), ForgeFlowError> {
    match cli.command {
        MapCommand::Upsert { id, data } => {
            let data = serde_json::from_str(&data)?;
            let doc = with_write_lock(core, |run_id| core.maps().upsert(&id, data, run_id))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        MapCommand::Get { id } => {
            let doc = core.maps().read(&id)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        MapCommand::List { status, tag } => {
            let filter = ListFilter {
                status: status.as_deref().map(parse_map_status).transpose()?,
                tag,
            };
            for map in core.maps().list(&filter)? {
                println!(
                    "{}  {}  tags=[{}]",
                    map.id,
                    format!("{:?}", map.status).to_lowercase(),
                    map.tags.join(",")
                );
            }
        }
        MapCommand::Top { tags, limit } => {
            let hint = ScoreHint {
                tags: tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            };
            for scored in core.maps().top_maps(&hint, limit)? {
                println!("{:.3}  {}", scored.score.total, scored.id);
            }
        }
        MapCommand::Delete { id } => {
            let doc = with_write_lock(core, |run_id| core.maps().delete(&id, run_id))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

/// Take the transaction lock under a fresh run id for the duration of one
/// CLI write, releasing on the way out.
fn with_write_lock<T>(
    core: &Core,
    f: impl FnOnce(&str) -> Result<T, ForgeFlowError>,
) -> Result<T, ForgeFlowError> {
    let run_id = crate::core::time::new_run_id();
    let lock = TransactionLock::with_settings(
        core.store(),
        Duration::from_millis(core.config().lock_poll_ms),
        core.config().stale_lock_secs,
    );
    let guard = lock.acquire(&run_id, Duration::from_secs(30), core.cancel_token())?;
    let result = f(&run_id);
    guard.release()?;
    result
}

fn run_dlq_cli(core: &Core, cli: DlqCli) -> Result<(), ForgeFlowError> {
    let dlq = core.dlq();
    match cli.command {
        DlqCommand::List { verb, status } => {
            let filter = DlqFilter {
                verb,
                status: status.as_deref().map(parse_dlq_status).transpose()?,
            };
            for entry in dlq.list(&filter)? {
                println!(
                    "{}  {}  {}  attempts={}",
                    entry.id,
                    format!("{:?}", entry.status).to_lowercase(),
                    entry.operation.verb,
                    entry.attempts
                );
            }
        }
        DlqCommand::Show { id } => {
            let entry = dlq.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        DlqCommand::Stats => {
            let stats = dlq.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        DlqCommand::Delete { id } => {
            dlq.delete(&id)?;
            println!("{} deleted {}", "ok".green(), id);
        }
    }
    Ok(())
}

fn run_wal_cli(core: &Core, cli: WalCli) -> Result<(), ForgeFlowError> {
    let wal = core.wal();
    match cli.command {
        WalCommand::Recover => {
            let report = wal.recover()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.pending.is_empty() {
                eprintln!(
                    "{} {} pending intent(s) reported; journals truncated",
                    "warning:".yellow(),
                    report.pending.len()
                );
            }
        }
        WalCommand::Verify => {
            wal.verify_mirror()?;
            println!("{} journal mirror intact", "ok".green());
        }
    }
    Ok(())
}

fn run_audit_cli(core: &Core, cli: AuditCli) -> Result<(), ForgeFlowError> {
    match cli.command {
        AuditCommand::Verify => {
            let report = core.audit().verify()?;
            if report.intact() {
                println!("{} {} entries, chain intact", "ok".green(), report.entries);
            } else {
                println!(
                    "{} chain diverges at entry {}",
                    "tampered:".red(),
                    report.first_divergence.unwrap_or_default()
                );
                return Err(ForgeFlowError::fault(
                    crate::core::error::ErrorKind::OperationFailed,
                    "audit chain verification failed",
                ));
            }
        }
    }
    Ok(())
}

fn run_health_cli(core: &Core, cli: HealthCli) -> Result<(), ForgeFlowError> {
    match cli.command {
        HealthCommand::Status => {
            let record = core.mesh().read()?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        HealthCommand::ResetWarnings => {
            let record = core.mesh().reset_warnings()?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

fn parse_run_outcome(s: &str) -> Result<RunState, ForgeFlowError> {
    match s {
        "succeeded" => Ok(RunState::Succeeded),
        "failed" => Ok(RunState::Failed),
        "partially_succeeded" => Ok(RunState::PartiallySucceeded),
        other => Err(ForgeFlowError::fault(
            crate::core::error::ErrorKind::OperationFailed,
            format!("unknown run outcome '{}'", other),
        )),
    }
}

fn parse_severity(s: &str) -> Result<Severity, ForgeFlowError> {
    match s {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => Err(ForgeFlowError::fault(
            crate::core::error::ErrorKind::OperationFailed,
            format!("unknown severity '{}'", other),
        )),
    }
}

fn parse_map_status(s: &str) -> Result<MapStatus, ForgeFlowError> {
    match s {
        "draft" => Ok(MapStatus::Draft),
        "active" => Ok(MapStatus::Active),
        "archived" => Ok(MapStatus::Archived),
        "deleted" => Ok(MapStatus::Deleted),
        other => Err(ForgeFlowError::fault(
            crate::core::error::ErrorKind::OperationFailed,
            format!("unknown map status '{}'", other),
        )),
    }
}

fn parse_dlq_status(s: &str) -> Result<DlqStatus, ForgeFlowError> {
    match s {
        "failed" => Ok(DlqStatus::Failed),
        "in_progress" => Ok(DlqStatus::InProgress),
        "resolved" => Ok(DlqStatus::Resolved),
        other => Err(ForgeFlowError::fault(
            crate::core::error::ErrorKind::OperationFailed,
            format!("unknown dlq status '{}'", other),
        )),
    }
}

/// Machine-readable description of the subsystems and their storage, for
/// orchestrators that introspect the runtime.
pub fn subsystem_manifest() -> serde_json::Value {
    json!({
        "name": "forgeflow",
        "version": env!("CARGO_PKG_VERSION"),
        "subsystems": [
            { "name": "lock", "storage": ["_wal/transaction.lock"] },
            { "name": "wal", "storage": ["_wal/pending_writes.jsonl", "_wal_shadow/pending_writes.jsonl"] },
            { "name": "audit", "storage": ["audit.jsonl"] },
            { "name": "ledger", "storage": ["events_ledger.jsonl", "status/seq.json"] },
            { "name": "health", "storage": ["status/health.json"] },
            { "name": "maps", "storage": ["maps/", "context/map_index_with_triggers.json", "context/hot_index.json"] },
            { "name": "schemas", "storage": ["_schema/"] },
            { "name": "dlq", "storage": ["_dlq/"] },
            { "name": "runs", "storage": ["runs/"] },
            { "name": "incidents", "storage": ["_incidents/"] },
        ],
        "invariants": [
            "primary and shadow journals are byte-equal after every successful write",
            "audit entries chain by SHA-256 over previous_hash || canonical(event)",
            "ledger sequence numbers are strictly increasing; idempotency keys unique",
            "hot index is bounded at 50 entries",
        ],
    })
}
