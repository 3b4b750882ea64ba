//! CoordKit - Distributed Coordination Recipes
//!
//! Configuration management plus embedded runs of the coordination
//! recipes against the in-process store.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordkit::config::{CoordConfig, LoggingConfig};
use coordkit::control::{
    ControlHandle, ControlLoop, CoordEvent, Directive, EventHandler, Participant,
};
use coordkit::error::{Error, Result};
use coordkit::retry::RetryConfig;
use coordkit::state::{
    ChangeNotifier, CrashMonitor, ElectionProtocol, ElectionState, Heartbeat, ValuePublisher,
};
use coordkit::store::memory::ClientId;
use coordkit::store::{MemoryStore, StoreClient};

/// CoordKit - Distributed Coordination Recipes
#[derive(Parser)]
#[command(name = "coordkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "coordkit.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "coordkit.toml")]
        output: PathBuf,

        /// Identity of this client
        #[arg(long, default_value = "server1")]
        identity: String,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration details
    Info,

    /// Run a leader election and fail the leader over repeatedly
    Elect {
        /// Number of candidates
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Number of leader failovers before stopping
        #[arg(short, long, default_value_t = 2)]
        rounds: usize,
    },

    /// Contend for a FIFO lock
    Lock {
        /// Number of contenders
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Time spent holding the lock
        #[arg(short, long, default_value_t = 200)]
        work_ms: u64,

        /// Acquisitions per contender
        #[arg(short, long, default_value_t = 2)]
        rounds: usize,
    },

    /// Watch worker heartbeats and crash some workers
    Monitor {
        /// Number of workers
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Number of workers to crash
        #[arg(long, default_value_t = 1)]
        crash: usize,
    },

    /// Write a value repeatedly while a watcher captures the changes
    Cdc {
        /// Number of writes
        #[arg(short, long, default_value_t = 5)]
        writes: usize,

        /// Delay between writes
        #[arg(short, long, default_value_t = 500)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = CoordConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_else(|_| LoggingConfig::default());
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Init { output, identity } => run_init(output, identity),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Elect { participants, rounds } => {
            let config = load_or_default(&cli.config)?;
            let mut sim = Simulation::new(&config);
            let scenario = run_elect(&mut sim, &config, participants, rounds);
            let result = until_interrupted(scenario).await;
            sim.shutdown().await;
            result
        }
        Commands::Lock { participants, work_ms, rounds } => {
            let config = load_or_default(&cli.config)?;
            let mut sim = Simulation::new(&config);
            let work = Duration::from_millis(work_ms);
            let scenario = run_lock(&mut sim, &config, participants, work, rounds);
            let result = until_interrupted(scenario).await;
            sim.shutdown().await;
            result
        }
        Commands::Monitor { workers, crash } => {
            let config = load_or_default(&cli.config)?;
            let mut sim = Simulation::new(&config);
            let result = until_interrupted(run_monitor(&mut sim, &config, workers, crash)).await;
            sim.shutdown().await;
            result
        }
        Commands::Cdc { writes, interval_ms } => {
            let config = load_or_default(&cli.config)?;
            let mut sim = Simulation::new(&config);
            let interval = Duration::from_millis(interval_ms);
            let result = until_interrupted(run_cdc(&mut sim, &config, writes, interval)).await;
            sim.shutdown().await;
            result
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Load the configuration file, or fall back to defaults when it is absent
fn load_or_default(config_path: &Path) -> Result<CoordConfig> {
    if config_path.exists() {
        CoordConfig::from_file(config_path)
    } else {
        tracing::info!("No configuration at {:?}, using defaults", config_path);
        Ok(CoordConfig::default())
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, identity: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{:?} already exists", output)));
    }

    let mut config = CoordConfig::default();
    config.coordination.identity = Some(identity);
    config.validate()?;

    let content = format!(
        "# CoordKit Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration written to {:?}", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CoordConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Endpoints: {}", config.endpoints().join(", "));
            println!("  Namespace: {}", config.coordination.namespace_path);
            println!(
                "  Identity: {}",
                config.coordination.identity.as_deref().unwrap_or("(auto)")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration details
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = CoordConfig::from_file(&config_path)?;
    let retry = config.retry();

    println!("CoordKit Client Information");
    println!("===========================");
    println!();
    println!("Store:");
    for endpoint in config.endpoints() {
        println!("  Endpoint:       {}", endpoint);
    }
    println!("  Session:        {:?}", config.session_timeout());
    println!(
        "  Retry:          {:?} .. {:?} (x{})",
        retry.initial_delay, retry.max_delay, retry.factor
    );
    match retry.max_retries {
        Some(max) => println!("  Max Retries:    {}", max),
        None => println!("  Max Retries:    unlimited"),
    }
    println!();
    println!("Coordination:");
    println!(
        "  Identity:       {}",
        config.coordination.identity.as_deref().unwrap_or("(auto)")
    );
    println!("  Namespace:      {}", config.coordination.namespace_path);
    println!("  Monitors:       {}", config.coordination.monitor_path);
    println!("  Data:           {}", config.coordination.data_path);
    println!();
    println!("Logging:          {} ({})", config.logging.level, config.logging.format);

    Ok(())
}

/// Prints every event as JSON and forwards it to the simulation driver
struct Reporter {
    label: String,
    tx: mpsc::UnboundedSender<(String, CoordEvent)>,
    work: Duration,
    /// Acquisitions left before the lock is released for good
    remaining: usize,
}

impl Reporter {
    /// Hold each acquired lock for `work`, requeueing until `rounds` are done
    fn with_work(mut self, work: Duration, rounds: usize) -> Self {
        self.work = work;
        self.remaining = rounds;
        self
    }
}

#[async_trait]
impl EventHandler for Reporter {
    async fn handle(&mut self, event: &CoordEvent) -> anyhow::Result<Directive> {
        println!("{:>12} {}", self.label, serde_json::to_string(event)?);
        self.tx.send((self.label.clone(), event.clone()))?;

        if !matches!(event, CoordEvent::LockAcquired { .. }) || self.remaining == 0 {
            return Ok(Directive::Continue);
        }

        tracing::info!("{} working for {:?}", self.label, self.work);
        tokio::time::sleep(self.work).await;
        self.remaining -= 1;
        Ok(if self.remaining > 0 {
            Directive::Requeue
        } else {
            Directive::Release
        })
    }
}

struct Member {
    label: String,
    client_id: ClientId,
    handle: ControlHandle,
    task: JoinHandle<Result<()>>,
}

/// Control loops sharing one embedded store
struct Simulation {
    store: MemoryStore,
    retry: RetryConfig,
    tx: mpsc::UnboundedSender<(String, CoordEvent)>,
    rx: mpsc::UnboundedReceiver<(String, CoordEvent)>,
    members: Vec<Member>,
}

impl Simulation {
    fn new(config: &CoordConfig) -> Self {
        tracing::info!(
            "Running against the embedded store (configured endpoints: {}, session timeout {:?})",
            config.endpoints().join(", "),
            config.session_timeout()
        );
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store: MemoryStore::with_session_timeout(config.session_timeout()),
            retry: config.retry(),
            tx,
            rx,
            members: Vec::new(),
        }
    }

    fn reporter(&self, label: &str) -> Reporter {
        Reporter {
            label: label.to_string(),
            tx: self.tx.clone(),
            work: Duration::ZERO,
            remaining: 0,
        }
    }

    async fn client(&self) -> (ClientId, Arc<dyn StoreClient>) {
        let client = self.store.connect().await;
        (client.id(), Arc::new(client))
    }

    /// Start a control loop with one participant on a fresh session
    async fn spawn<P, F>(&mut self, reporter: Reporter, build: F) -> Result<()>
    where
        P: Participant + 'static,
        F: FnOnce(Arc<dyn StoreClient>) -> Result<P>,
    {
        let label = reporter.label.clone();
        let (client_id, client) = self.client().await;
        let mut control =
            ControlLoop::new(Arc::clone(&client), reporter).with_retry(self.retry.clone());
        control.add(build(client)?);
        control.start().await?;

        let handle = control.handle();
        let task = tokio::spawn(control.run());
        self.members.push(Member {
            label,
            client_id,
            handle,
            task,
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<(String, CoordEvent)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Internal("every control loop stopped".into()))
    }

    /// Gracefully stop a member, releasing its nodes
    async fn stop(&mut self, label: &str) {
        if let Some(index) = self.members.iter().position(|m| m.label == label) {
            let member = self.members.remove(index);
            finish(member).await;
        }
    }

    /// Kill a member without releasing anything. The store expires its
    /// session once the session timeout passes.
    async fn crash(&mut self, label: &str) {
        if let Some(index) = self.members.iter().position(|m| m.label == label) {
            let member = self.members.remove(index);
            member.task.abort();
            self.store.partition(member.client_id).await;
            tracing::warn!("Crashed {}", member.label);
        }
    }

    async fn shutdown(&mut self) {
        for member in self.members.drain(..) {
            finish(member).await;
        }
    }
}

async fn finish(member: Member) {
    // The loop may already have stopped on its own
    let _ = member.handle.shutdown();
    match member.task.await {
        Ok(Ok(())) => tracing::debug!("{} stopped", member.label),
        Ok(Err(e)) => tracing::error!("{} failed: {}", member.label, e),
        Err(e) => tracing::error!("{} panicked: {}", member.label, e),
    }
}

/// Run a scenario until it completes or Ctrl-C arrives
async fn until_interrupted(scenario: impl Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = scenario => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    }
}

fn participant_identity(base: &str, index: usize) -> String {
    format!("{}-{}", base, index)
}

async fn run_elect(
    sim: &mut Simulation,
    config: &CoordConfig,
    participants: usize,
    rounds: usize,
) -> Result<()> {
    let namespace = config.coordination.namespace_path.clone();
    let base = config.identity();
    let rounds = rounds.min(participants.saturating_sub(1));

    for i in 0..participants {
        let identity = participant_identity(&base, i);
        let reporter = sim.reporter(&identity);
        sim.spawn(reporter, |client| {
            ElectionProtocol::leader_election(client, &namespace, &identity)
        })
        .await?;
    }

    let mut failovers = 0;
    loop {
        let (label, event) = sim.next_event().await?;
        if let CoordEvent::RoleChanged { role: ElectionState::Leader, .. } = event {
            tracing::info!("{} is the leader", label);
            if failovers == rounds {
                return Ok(());
            }
            failovers += 1;
            sim.stop(&label).await;
        }
    }
}

async fn run_lock(
    sim: &mut Simulation,
    config: &CoordConfig,
    participants: usize,
    work: Duration,
    rounds: usize,
) -> Result<()> {
    let namespace = config.coordination.namespace_path.clone();
    let base = config.identity();
    let rounds = rounds.max(1);

    for i in 0..participants {
        let identity = participant_identity(&base, i);
        let reporter = sim.reporter(&identity).with_work(work, rounds);
        sim.spawn(reporter, |client| ElectionProtocol::lock(client, &namespace, &identity))
            .await?;
    }

    let mut acquisitions = 0;
    while acquisitions < participants * rounds {
        if let (label, CoordEvent::LockAcquired { .. }) = sim.next_event().await? {
            acquisitions += 1;
            tracing::info!("{} holds the lock ({}/{})", label, acquisitions, participants * rounds);
        }
    }
    Ok(())
}

async fn run_monitor(
    sim: &mut Simulation,
    config: &CoordConfig,
    workers: usize,
    crash: usize,
) -> Result<()> {
    let heartbeat_path = config.coordination.namespace_path.clone();
    let monitor_path = config.coordination.monitor_path.clone();
    let base = config.identity();

    let reporter = sim.reporter("monitor");
    sim.spawn(reporter, |client| {
        CrashMonitor::new(client, &heartbeat_path)?.register_under(&monitor_path)
    })
    .await?;

    let mut identities = Vec::new();
    for i in 0..workers {
        let identity = participant_identity(&base, i);
        let reporter = sim.reporter(&identity);
        sim.spawn(reporter, |client| Heartbeat::new(client, &heartbeat_path, &identity))
            .await?;
        identities.push(identity);
    }

    let mut discovered = 0;
    while discovered < workers {
        if let (_, CoordEvent::MemberDiscovered { .. }) = sim.next_event().await? {
            discovered += 1;
        }
    }

    for identity in identities.iter().take(crash) {
        sim.crash(identity).await;
        loop {
            if let (_, CoordEvent::MemberLost { member, .. }) = sim.next_event().await? {
                if &member == identity {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn run_cdc(
    sim: &mut Simulation,
    config: &CoordConfig,
    writes: usize,
    interval: Duration,
) -> Result<()> {
    let data_path = config.coordination.data_path.clone();
    let identity = config.identity();

    let reporter = sim.reporter("watcher");
    sim.spawn(reporter, |client| ChangeNotifier::new(client, &data_path))
        .await?;

    let (_, client) = sim.client().await;
    let publisher = ValuePublisher::new(client, &data_path).await?;

    let mut last_version = 0;
    for _ in 0..writes {
        tokio::time::sleep(interval).await;
        let value = format!(
            "data: {} modified by: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            identity
        );
        last_version = publisher.publish(Bytes::from(value)).await?.version;
    }

    if writes == 0 {
        return Ok(());
    }
    loop {
        if let (_, CoordEvent::ValueChanged { stat, .. }) = sim.next_event().await? {
            if stat.version >= last_version {
                return Ok(());
            }
        }
    }
}
