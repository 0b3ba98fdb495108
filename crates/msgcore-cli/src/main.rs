use std::sync::Arc;

use clap::{Parser, Subcommand};
use msgcore_bus::DownstreamTopics;
use msgcore_dedup::InProcessDedup;
use msgcore_hotcache::HotCache;
use msgcore_idgen::{FileLeaseCoordinator, IdGenerator, NodeLease, StaticNodeLease};
use msgcore_repo::LiveRepo;
use msgcore_sessions::InProcessSessionRegistry;
use msgcore_store::SqliteStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "msgcore", about = "msgcore — a distributed instant-messaging backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a gateway instance: WebSocket session lifecycle plus, since the
    /// only `MsgBus` implementation shipped is in-process (real deployments
    /// swap in a Kafka/NATS-backed one, spec §2 "External Interfaces"), the
    /// Logic and Task workers that instance's bus topics feed. Horizontal
    /// scale-out is multiple `gateway` instances behind a shared `Store`,
    /// matching spec §1's "horizontally-scaled gateway fleet".
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        instance_id: Option<String>,
        /// Fixed Snowflake node id (0..1024). Without this, a node id is
        /// leased exclusively from a file under the data directory, so
        /// several instances can share one host.
        #[arg(long)]
        node_id: Option<u16>,
    },
    /// Run only the Logic ingress pipeline against the given upstream
    /// partitions, with no gateway or task component. Meaningful once
    /// `msgcore-bus` gains a networked backend; against the in-process
    /// backend this is for partition-isolation testing, not fleet
    /// deployment (that still runs `gateway`, which owns the bus instance).
    Logic {
        /// Comma-separated upstream partition indices to consume, e.g. `0,3,7`.
        #[arg(long)]
        partitions: Option<String>,
    },
    /// Run only the Task fan-out workers against the configured task
    /// partitions, with no gateway or logic component. Same caveat as
    /// `logic` applies to the in-process bus.
    Task,
    /// Run pending store migrations against the configured database and exit.
    Migrate,
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,
    /// Print the path the config loader would read/write.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "msgcore starting");

    match cli.command {
        Commands::Gateway { bind, port, instance_id, node_id } => gateway(bind, port, instance_id, node_id).await,
        Commands::Logic { partitions } => logic_only(partitions).await,
        Commands::Task => task_only().await,
        Commands::Migrate => migrate().await,
        Commands::Config { action } => config_command(action),
    }
}

/// Wires every component — Store, HotCache, SessionRegistry, SeqAllocator,
/// IdGenerator, DedupStore, Repo, one LogicWorker per upstream partition,
/// one TaskWorker per task partition — then starts the Gateway HTTP/WS
/// server in this same process. This is the unit that actually scales out
/// (spec §1's gateway fleet): several `gateway` instances share one `Store`
/// and each owns its own in-process bus and downstream-consumer set.
async fn gateway(bind: Option<String>, port: Option<u16>, instance_id: Option<String>, node_id: Option<u16>) -> anyhow::Result<()> {
    let mut config = msgcore_config::discover_and_load();
    if let Some(bind) = bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(instance_id) = instance_id {
        config.gateway.instance_id = instance_id;
    }

    #[cfg(feature = "metrics")]
    msgcore_metrics::describe();

    let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(8).connect(&config.store.database_url).await?;
    let store = Arc::new(SqliteStore::new(pool).await?);
    let hot_cache = Arc::new(HotCache::new(config.repo.hot_window_size));

    let sessions_ttl = std::time::Duration::from_secs(config.sessions.ttl_secs);
    let sessions = Arc::new(InProcessSessionRegistry::new(sessions_ttl));
    sessions.spawn_sweep(std::time::Duration::from_secs(config.sessions.sweep_interval_secs));

    let repo: Arc<dyn msgcore_repo::Repo> = Arc::new(LiveRepo::new(Arc::clone(&store), Arc::clone(&hot_cache), sessions));

    let node_id = match node_id {
        Some(id) => StaticNodeLease(id).acquire_node_id().await?,
        None => FileLeaseCoordinator::new(msgcore_config::data_dir().join("idgen-leases")).acquire_node_id().await?,
    };
    let idgen = Arc::new(IdGenerator::new(node_id as u64)?);
    info!(node_id, "acquired Snowflake node id");

    let dedup = Arc::new(InProcessDedup::new());
    let seqalloc: Arc<dyn msgcore_seqalloc::SeqAllocator> = Arc::new(msgcore_seqalloc::SqliteSeqAllocator::new(store.pool().clone()).await?);

    let upstream_topic = msgcore_bus::upstream_topic(config.bus.upstream_partitions);
    let task_topic = msgcore_bus::task_topic(config.bus.task_partitions);
    let dead_letter = msgcore_bus::dead_letter_topic();
    let downstream_topics = Arc::new(DownstreamTopics::new(config.bus.downstream_partitions));

    let logic_config = msgcore_logic::LogicConfig {
        dedupe_ttl: std::time::Duration::from_millis(config.logic.dedupe_ttl_ms),
        large_group_threshold: config.logic.large_group_threshold,
        persistence_retry: msgcore_common::retry::Backoff::exponential(config.logic.persistence_retry_attempts, std::time::Duration::from_millis(config.logic.persistence_retry_base_ms)),
    };
    for consumer in upstream_topic.take_all_partitions() {
        let worker = msgcore_logic::LogicWorker::new(consumer, Arc::clone(&repo), Arc::clone(&dedup) as _, Arc::clone(&seqalloc), Arc::clone(&idgen), Arc::clone(&downstream_topics), Arc::clone(&task_topic), Arc::clone(&dead_letter), logic_config.clone());
        tokio::spawn(worker.run());
    }

    let task_config = msgcore_task::TaskConfig {
        page_size: config.task.page_size,
        worker_pool: config.task.worker_pool,
        max_emit_per_publish: config.task.max_emit_per_publish,
        page_retry: msgcore_common::retry::Backoff::exponential(config.task.page_retry_attempts, std::time::Duration::from_millis(config.task.page_retry_base_ms)),
    };
    for consumer in task_topic.take_all_partitions() {
        let worker = msgcore_task::TaskWorker::new(consumer, Arc::clone(&repo), Arc::clone(&downstream_topics), task_config.clone());
        tokio::spawn(worker.run());
    }

    let auth = msgcore_gateway::auth::resolve_auth(config.gateway.bearer_token.clone(), None);
    let gateway_state = msgcore_gateway::state::GatewayState::new(config.gateway.instance_id.clone(), repo, upstream_topic, downstream_topics, auth, config.gateway.clone());

    msgcore_gateway::server::start_gateway(gateway_state).await
}

/// Run only the Logic component against its own, freshly-created in-process
/// bus — since nothing shares that bus with a `gateway` process, this is a
/// standalone exercise of the ingress pipeline against whatever publishes
/// to it, useful for partition-level load testing and for the CLI surface
/// spec §4.2 asks for; it is not how a production fleet wires Logic (that
/// happens inside `gateway`, sharing its bus instance).
async fn logic_only(partitions: Option<String>) -> anyhow::Result<()> {
    let config = msgcore_config::discover_and_load();

    let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(8).connect(&config.store.database_url).await?;
    let store = Arc::new(SqliteStore::new(pool).await?);
    let hot_cache = Arc::new(HotCache::new(config.repo.hot_window_size));
    let sessions = Arc::new(InProcessSessionRegistry::new(std::time::Duration::from_secs(config.sessions.ttl_secs)));
    let repo: Arc<dyn msgcore_repo::Repo> = Arc::new(LiveRepo::new(Arc::clone(&store), Arc::clone(&hot_cache), sessions));

    let node_id = FileLeaseCoordinator::new(msgcore_config::data_dir().join("idgen-leases")).acquire_node_id().await?;
    let idgen = Arc::new(IdGenerator::new(node_id as u64)?);
    let dedup = Arc::new(InProcessDedup::new());
    let seqalloc: Arc<dyn msgcore_seqalloc::SeqAllocator> = Arc::new(msgcore_seqalloc::SqliteSeqAllocator::new(store.pool().clone()).await?);

    let upstream_topic = msgcore_bus::upstream_topic(config.bus.upstream_partitions);
    let task_topic = msgcore_bus::task_topic(config.bus.task_partitions);
    let dead_letter = msgcore_bus::dead_letter_topic();
    let downstream_topics = Arc::new(DownstreamTopics::new(config.bus.downstream_partitions));

    let logic_config = msgcore_logic::LogicConfig {
        dedupe_ttl: std::time::Duration::from_millis(config.logic.dedupe_ttl_ms),
        large_group_threshold: config.logic.large_group_threshold,
        persistence_retry: msgcore_common::retry::Backoff::exponential(config.logic.persistence_retry_attempts, std::time::Duration::from_millis(config.logic.persistence_retry_base_ms)),
    };

    let selected = parse_partitions(partitions.as_deref(), config.bus.upstream_partitions);
    info!(?selected, "logic worker starting for upstream partitions");
    let mut handles = Vec::new();
    for partition in selected {
        let consumer = upstream_topic.take_partition(partition)?;
        let worker = msgcore_logic::LogicWorker::new(consumer, Arc::clone(&repo), Arc::clone(&dedup) as _, Arc::clone(&seqalloc), Arc::clone(&idgen), Arc::clone(&downstream_topics), Arc::clone(&task_topic), Arc::clone(&dead_letter), logic_config.clone());
        handles.push(tokio::spawn(worker.run()));
    }

    for handle in handles {
        handle.await?;
    }
    Ok(())
}

/// Run only the Task fan-out workers against their own in-process bus; same
/// standalone caveat as [`logic_only`].
async fn task_only() -> anyhow::Result<()> {
    let config = msgcore_config::discover_and_load();

    let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(8).connect(&config.store.database_url).await?;
    let store = Arc::new(SqliteStore::new(pool).await?);
    let hot_cache = Arc::new(HotCache::new(config.repo.hot_window_size));
    let sessions = Arc::new(InProcessSessionRegistry::new(std::time::Duration::from_secs(config.sessions.ttl_secs)));
    let repo: Arc<dyn msgcore_repo::Repo> = Arc::new(LiveRepo::new(Arc::clone(&store), Arc::clone(&hot_cache), sessions));

    let task_topic = msgcore_bus::task_topic(config.bus.task_partitions);
    let downstream_topics = Arc::new(DownstreamTopics::new(config.bus.downstream_partitions));
    let task_config = msgcore_task::TaskConfig {
        page_size: config.task.page_size,
        worker_pool: config.task.worker_pool,
        max_emit_per_publish: config.task.max_emit_per_publish,
        page_retry: msgcore_common::retry::Backoff::exponential(config.task.page_retry_attempts, std::time::Duration::from_millis(config.task.page_retry_base_ms)),
    };

    info!(partitions = config.bus.task_partitions, "task worker starting");
    let mut handles = Vec::new();
    for consumer in task_topic.take_all_partitions() {
        let worker = msgcore_task::TaskWorker::new(consumer, Arc::clone(&repo), Arc::clone(&downstream_topics), task_config.clone());
        handles.push(tokio::spawn(worker.run()));
    }

    for handle in handles {
        handle.await?;
    }
    Ok(())
}

/// Parses `--partitions 0,3,7`; defaults to every partition in range when absent.
fn parse_partitions(spec: Option<&str>, total: u32) -> Vec<u32> {
    match spec {
        Some(s) => s.split(',').filter_map(|part| part.trim().parse::<u32>().ok()).collect(),
        None => (0..total).collect(),
    }
}

async fn migrate() -> anyhow::Result<()> {
    let config = msgcore_config::discover_and_load();
    let pool = sqlx::sqlite::SqlitePoolOptions::new().max_connections(1).connect(&config.store.database_url).await?;
    SqliteStore::new(pool).await?;
    info!(database_url = %config.store.database_url, "migrations applied");
    Ok(())
}

fn config_command(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = msgcore_config::discover_and_load();
            println!("{}", serde_json::to_string_pretty(&config)?);
        },
        ConfigAction::Path => {
            let path = msgcore_config::find_or_default_config_path();
            println!("{}", path.display());
        },
    }
    Ok(())
}
