use clap::Parser;
use shardlease::config::Config;
use shardlease::fleet::{EnvFleetProbe, NoHostReplicaProbe};
use shardlease::processor::NoopProcessorFactory;
use shardlease::store::memory::InMemoryStore;
use shardlease::store::postgres::PostgresStore;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shardlease", about = "Dynamic shard-lease coordinator")]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// "postgres" (requires SHARDLEASE_DATABASE_URL) or "memory" (dev only,
    /// state is lost on restart).
    #[clap(long, env = "SHARDLEASE_STORE", default_value = "postgres")]
    store: String,

    #[clap(long, env = "SHARDLEASE_DATABASE_URL")]
    database_url: Option<String>,

    /// JSON file of open shards, polled by the dev-mode `FileTopology`.
    #[clap(long, env = "SHARDLEASE_TOPOLOGY_FILE")]
    topology_file: Option<std::path::PathBuf>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        config,
        store,
        database_url,
        topology_file,
    } = cli;

    let topology_file = topology_file.ok_or_else(|| {
        anyhow::anyhow!("--topology-file/SHARDLEASE_TOPOLOGY_FILE is required (see FileTopology)")
    })?;
    let topology = Arc::new(shardlease::topology::FileTopology::new(topology_file));
    let fleet = Arc::new(EnvFleetProbe::new(
        config.worker_count_env_var.clone(),
        Box::new(NoHostReplicaProbe),
    ));
    let processor_factory = Arc::new(NoopProcessorFactory);

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c signal handler");
        tracing::info!("shutdown signal received; releasing held leases");
    };

    match store.as_str() {
        "memory" => {
            let store = Arc::new(InMemoryStore::new());
            shardlease::run(store, topology, fleet, processor_factory, config, shutdown).await?;
        }
        "postgres" => {
            let database_url = database_url
                .ok_or_else(|| anyhow::anyhow!("--database-url/SHARDLEASE_DATABASE_URL is required"))?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&database_url)
                .await?;
            let store = Arc::new(PostgresStore::new(pool));
            store.ensure_schema().await?;
            shardlease::run(store, topology, fleet, processor_factory, config, shutdown).await?;
        }
        other => anyhow::bail!("unrecognized --store {other:?}, expected \"postgres\" or \"memory\""),
    }

    Ok(())
}
