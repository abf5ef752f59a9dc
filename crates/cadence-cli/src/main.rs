mod config_watcher;
mod transport;

use cadence_core::{
    AgentStatus, CompletionSignal, ResolutionDecision, ResolutionRequest, SignalEnvelope,
    WorkerRole,
};
use cadence_orchestrator::{
    Backlog, GatePolicy, JsonStateStore, Orchestrator, QualityGate, SchedulerConfig, StateStore,
    StatusReport,
};
use clap::{Parser, Subcommand};
use config_watcher::ConfigWatcher;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{FileDispatcher, FileInbox};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "cadence", about = "Cadence, a content pipeline orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop until the backlog settles
    Run {
        /// Backlog file (overrides config)
        #[arg(short, long)]
        backlog: Option<PathBuf>,
        /// Stop after this many iterations
        #[arg(long)]
        max_iterations: Option<u64>,
        /// How often to check the inbox, in milliseconds
        #[arg(long, default_value_t = 250)]
        poll_ms: u64,
    },
    /// Print the status report from persisted state
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Queue a worker status signal for the running loop
    Signal {
        role: WorkerRole,
        status: AgentStatus,
        /// Self-validation result (required with `complete`)
        #[arg(long)]
        passed: Option<bool>,
        /// A failed check id (repeatable)
        #[arg(long = "failed")]
        failed_checks: Vec<String>,
        /// The task being reported on
        #[arg(long)]
        task: Option<Uuid>,
        /// A produced artifact reference (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
    },
    /// Answer a pending escalation
    Resolve {
        escalation_id: Uuid,
        /// approve | reject
        decision: ResolutionDecision,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// List escalations
    Escalations {
        /// Include answered and dismissed escalations
        #[arg(long)]
        all: bool,
    },
    /// Check backlog readiness without running anything
    Check {
        /// Backlog file (overrides config)
        #[arg(short, long)]
        backlog: Option<PathBuf>,
    },
}

#[derive(Deserialize)]
struct CadenceConfig {
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    backlog: Option<PathBuf>,
    #[serde(default)]
    gate: GatePolicy,
    #[serde(default)]
    scheduler: SchedulerConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backlog: None,
            gate: GatePolicy::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl CadenceConfig {
    /// Load the config file, or defaults if it does not exist.
    async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            }
        };
        let mut config: CadenceConfig = toml::from_str(&raw)?;

        // Relative paths are relative to the config file.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        if config.data_dir.is_relative() {
            config.data_dir = base.join(&config.data_dir);
        }
        if let Some(backlog) = config.backlog.as_mut() {
            if backlog.is_relative() {
                *backlog = base.join(&*backlog);
            }
        }
        Ok(config)
    }

    fn backlog_path(&self, flag: Option<PathBuf>) -> Option<PathBuf> {
        flag.or_else(|| self.backlog.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = CadenceConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run {
            backlog,
            max_iterations,
            poll_ms,
        } => {
            let backlog = match config.backlog_path(backlog) {
                Some(path) => Some(Backlog::load(&path).await?),
                None => None,
            };
            let mut scheduler = config.scheduler.clone();
            if max_iterations.is_some() {
                scheduler.max_iterations = max_iterations;
            }

            let store = Arc::new(JsonStateStore::new(&config.data_dir).await?);
            let dispatcher = Arc::new(FileDispatcher::open(&config.data_dir).await?);
            info!(
                data_dir = %config.data_dir.display(),
                outbox = %dispatcher.path().display(),
                "Starting Cadence"
            );

            let orch = Arc::new(
                Orchestrator::resume(store, dispatcher, backlog)
                    .await?
                    .with_config(scheduler)
                    .with_gate_policy(config.gate.clone())?,
            );

            let inbox = FileInbox::open(&config.data_dir).await?;
            let pump = tokio::spawn(pump_inbox(
                inbox,
                orch.signal_sender(),
                orch.resolution_sender(),
                Duration::from_millis(poll_ms),
            ));
            let _watcher = watch_config(&cli.config, orch.clone());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let run = orch.run(shutdown_rx);
            tokio::pin!(run);
            let summary = tokio::select! {
                result = &mut run => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    let _ = shutdown_tx.send(true);
                    run.await?
                }
            };
            pump.abort();

            println!(
                "Stopped after {} iteration(s): {:?}",
                summary.iterations, summary.stop
            );
            println!("{}", orch.status_report().await);
        }
        Commands::Status { json } => {
            let store = JsonStateStore::new(&config.data_dir).await?;
            match store.load().await? {
                None => println!("No state in {} yet.", config.data_dir.display()),
                Some(snapshot) => {
                    let report = StatusReport::from_snapshot(&snapshot);
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!("{report}");
                    }
                }
            }
        }
        Commands::Signal {
            role,
            status,
            passed,
            failed_checks,
            task,
            artifacts,
        } => {
            let signal = CompletionSignal::try_from(SignalEnvelope {
                role,
                status,
                passed,
                failed_checks,
                task_id: task,
                artifacts,
            })?;
            let inbox = FileInbox::open(&config.data_dir).await?;
            inbox.push_signal(&signal).await?;
            println!("Queued {} signal from {}.", signal.status, signal.role);
        }
        Commands::Resolve {
            escalation_id,
            decision,
            note,
        } => {
            let request = ResolutionRequest {
                escalation_id,
                decision,
                note,
            };
            let inbox = FileInbox::open(&config.data_dir).await?;
            inbox.push_resolution(&request).await?;
            println!("Queued {decision} for escalation {escalation_id}.");
        }
        Commands::Escalations { all } => {
            let store = JsonStateStore::new(&config.data_dir).await?;
            let Some(snapshot) = store.load().await? else {
                println!("No state in {} yet.", config.data_dir.display());
                return Ok(());
            };
            let escalations = if all {
                snapshot.escalations.all()
            } else {
                snapshot.escalations.unresolved()
            };
            if escalations.is_empty() {
                println!("No escalations.");
            }
            for e in &escalations {
                println!(
                    "{} [{}] {} {} ({})",
                    e.id, e.priority, e.story_id, e.category, e.status
                );
                if !e.reasons.is_empty() {
                    println!("    reasons: {}", e.reasons.join(", "));
                }
                println!("    recommendation: {}", e.recommendation);
                if let Some(resolution) = &e.resolution {
                    println!("    answered: {} {}", resolution.decision, resolution.note);
                }
            }
        }
        Commands::Check { backlog } => {
            let path = config
                .backlog_path(backlog)
                .ok_or_else(|| anyhow::anyhow!("No backlog given (use --backlog or set `backlog` in the config)"))?;
            let backlog = Backlog::load(&path).await?;
            let gate = QualityGate::new(config.gate.clone())?;

            let mut ready = 0;
            for story in &backlog.stories {
                let report = gate.readiness(story, &backlog);
                if !report.missing.is_empty() {
                    println!("{}: not ready ({})", story.id, report.missing.join("; "));
                } else if !report.ambiguities.is_empty() {
                    println!(
                        "{}: needs a decision ({})",
                        story.id,
                        report.ambiguities.join("; ")
                    );
                } else if !report.waiting_on.is_empty() {
                    ready += 1;
                    println!("{}: ready, after {}", story.id, report.waiting_on.join(", "));
                } else {
                    ready += 1;
                    println!("{}: ready", story.id);
                }
            }
            println!("\n{ready}/{} stories ready", backlog.stories.len());
        }
    }

    Ok(())
}

/// Forward inbox files into the loop's channels until aborted.
async fn pump_inbox(
    inbox: FileInbox,
    signals: mpsc::UnboundedSender<CompletionSignal>,
    resolutions: mpsc::UnboundedSender<ResolutionRequest>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match inbox.claim_resolutions().await {
            Ok(batch) => {
                for request in batch {
                    if resolutions.send(request).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read resolution inbox"),
        }
        match inbox.claim_signals().await {
            Ok(batch) => {
                for signal in batch {
                    if signals.send(signal).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to read signal inbox"),
        }
    }
}

/// Hot-reload the `[gate]` section into the running loop.
fn watch_config(path: &Path, orch: Arc<Orchestrator>) -> Option<ConfigWatcher> {
    if !path.exists() {
        return None;
    }
    let handle = tokio::runtime::Handle::current();
    let watcher = ConfigWatcher::start(path.to_path_buf(), 500, move |reloaded| {
        let Some(policy) = reloaded.gate else {
            return;
        };
        let orch = orch.clone();
        handle.spawn(async move {
            if let Err(e) = orch.set_gate_policy(policy).await {
                warn!(error = %e, "Reloaded gate policy rejected");
            }
        });
    });
    match watcher {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Config hot-reload disabled");
            None
        }
    }
}
