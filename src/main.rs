//! taskbridge: run workers and the reaper, submit tasks, inspect them, or
//! chat through the bridge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use taskbridge::bus::{InMemoryBus, MessageBus};
use taskbridge::compute::{Compute, EchoCompute};
use taskbridge::config::{BackendKind, BridgeConfig, ComputeKind};
use taskbridge::frontend::{interpret, ChatSession, Intent, Reply};
use taskbridge::store::{GenericTaskStore, InMemoryBackend, TaskStore};
use taskbridge::{AwaitOutcome, Correlator, Payload, Reaper, WorkerLoop};

/// Task-correlation bridge between chat front-ends and worker pools
#[derive(Parser)]
#[command(name = "taskbridge")]
#[command(about = "Submit work through a message bus and correlate the results", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./taskbridge.toml when present)
    #[arg(long, global = true, env = "TASKBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker until Ctrl-C
    Worker {
        /// Also run the reaper in this process
        #[arg(long)]
        with_reaper: bool,
    },

    /// Run the reaper until Ctrl-C
    Reaper,

    /// Submit a task
    Submit {
        /// Task input
        body: String,

        /// Payload schema name
        #[arg(long, default_value = taskbridge::domain::TEXT_SCHEMA)]
        schema: String,

        /// Payload schema version
        #[arg(long, default_value_t = 1)]
        schema_version: u32,

        /// Wait for the outcome
        #[arg(long)]
        wait: bool,

        /// Seconds to wait (defaults to correlator.wait_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print a task record as JSON
    Status {
        /// Correlation id returned by `submit`
        correlation_id: String,
    },

    /// Interactive chat on stdin
    ///
    /// With in-memory backends a worker and reaper run in the same process.
    Chat,
}

struct Bridge {
    config: BridgeConfig,
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
}

impl Bridge {
    async fn open(config: BridgeConfig) -> Result<Self> {
        let store = open_store(&config).await?;
        let bus = open_bus(&config).await?;
        Ok(Self { config, store, bus })
    }

    fn in_process(&self) -> bool {
        self.config.store.backend == BackendKind::Memory
            || self.config.bus.backend == BackendKind::Memory
    }

    fn correlator(&self) -> Correlator {
        Correlator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.config.correlator_config(),
        )
    }

    fn worker(&self) -> Result<WorkerLoop> {
        Ok(WorkerLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            open_compute(&self.config)?,
            self.config.worker_config()?,
        ))
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.config.reaper_config(),
        )
    }
}

async fn open_store(config: &BridgeConfig) -> Result<Arc<dyn TaskStore>> {
    let store_config = config.store_config();
    match config.store.backend {
        BackendKind::Memory => Ok(Arc::new(
            GenericTaskStore::new(InMemoryBackend::new()).with_config(store_config),
        )),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let backend = taskbridge::store::redis::RedisBackend::new(&config.store.redis_url)
                .await
                .context("failed to open Redis task store")?;
            Ok(Arc::new(GenericTaskStore::new(backend).with_config(store_config)))
        },
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => bail!("the redis store backend requires the `redis` feature"),
    }
}

async fn open_bus(config: &BridgeConfig) -> Result<Arc<dyn MessageBus>> {
    match config.bus.backend {
        BackendKind::Memory => Ok(Arc::new(InMemoryBus::new())),
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let bus = taskbridge::bus::redis::RedisStreamBus::new(&config.bus.redis_url)
                .await
                .context("failed to open Redis Streams bus")?;
            Ok(Arc::new(bus))
        },
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => bail!("the redis bus backend requires the `redis` feature"),
    }
}

fn open_compute(config: &BridgeConfig) -> Result<Arc<dyn Compute>> {
    match config.compute.kind {
        ComputeKind::Echo => Ok(Arc::new(EchoCompute)),
        #[cfg(feature = "http-compute")]
        ComputeKind::Http => {
            let endpoint = config
                .compute
                .endpoint
                .clone()
                .context("compute.endpoint is required for the http collaborator")?;
            let timeout = config.worker_config()?.compute_timeout;
            let compute = taskbridge::compute::HttpCompute::new(endpoint, timeout)?;
            Ok(Arc::new(compute))
        },
        #[cfg(not(feature = "http-compute"))]
        ComputeKind::Http => bail!("the http compute collaborator requires the `http-compute` feature"),
    }
}

/// Cancels the returned token on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                trigger.cancel();
            },
            Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    taskbridge::logging::init_logging(cli.log_json);

    let config = BridgeConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    let bridge = Bridge::open(config).await?;

    match cli.command {
        Commands::Worker { with_reaper } => run_worker(&bridge, with_reaper).await,
        Commands::Reaper => {
            bridge.reaper().run(shutdown_on_ctrl_c()).await;
            Ok(())
        },
        Commands::Submit {
            body,
            schema,
            schema_version,
            wait,
            timeout,
        } => submit(&bridge, Payload::new(schema, schema_version, body), wait, timeout).await,
        Commands::Status { correlation_id } => {
            let record = bridge.correlator().status(&correlation_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        },
        Commands::Chat => chat(&bridge).await,
    }
}

async fn run_worker(bridge: &Bridge, with_reaper: bool) -> Result<()> {
    if bridge.in_process() {
        tracing::warn!("in-memory backend selected, the worker only sees tasks from this process");
    }
    let shutdown = shutdown_on_ctrl_c();
    let worker = bridge.worker()?;
    if with_reaper {
        let reaper = bridge.reaper();
        tokio::join!(worker.run(shutdown.clone()), reaper.run(shutdown));
    } else {
        worker.run(shutdown).await;
    }
    Ok(())
}

async fn submit(bridge: &Bridge, payload: Payload, wait: bool, timeout: Option<u64>) -> Result<()> {
    if bridge.in_process() && wait {
        bail!("--wait needs shared backends; set TASKBRIDGE_STORE_BACKEND and TASKBRIDGE_BUS_BACKEND to redis");
    }
    let correlator = bridge.correlator();
    let correlation_id = correlator.submit(payload).await?;
    println!("{correlation_id}");
    if !wait {
        return Ok(());
    }

    let timeout = timeout.map_or(correlator.config().default_timeout, Duration::from_secs);
    match correlator.await_result(&correlation_id, timeout).await? {
        AwaitOutcome::Completed(result) => println!("{}", result.body),
        AwaitOutcome::Failed(reason) => bail!("task failed: {reason}"),
        AwaitOutcome::TimedOut => {
            eprintln!("still running; check with `taskbridge status {correlation_id}`");
        },
    }
    Ok(())
}

async fn chat(bridge: &Bridge) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();
    if bridge.in_process() {
        let worker = bridge.worker()?;
        let reaper = bridge.reaper();
        let token = shutdown.clone();
        background.push(tokio::spawn(async move { worker.run(token).await }));
        let token = shutdown.clone();
        background.push(tokio::spawn(async move { reaper.run(token).await }));
    }

    let session = ChatSession::new(
        Arc::new(bridge.correlator()),
        bridge.config.correlator_config().default_timeout,
    );
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    say(&mut stdout, &Reply::Welcome).await?;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let intent = interpret(&line);
        if matches!(intent, Intent::BirthDate(_)) {
            stdout
                .write_all(b"Generating your reading... This may take a few seconds.\n")
                .await?;
            stdout.flush().await?;
        }
        let reply = session.handle_message(&line).await;
        say(&mut stdout, &reply).await?;
        if intent == Intent::Cancel {
            break;
        }
    }

    shutdown.cancel();
    for handle in background {
        handle.await.context("background task panicked")?;
    }
    Ok(())
}

async fn say(stdout: &mut tokio::io::Stdout, reply: &Reply) -> Result<()> {
    stdout.write_all(format!("{reply}\n\n").as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
