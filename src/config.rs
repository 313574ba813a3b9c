//! Configuration (spec §6 "Configuration"), in the style of
//! `data_plane_controller::job::JobArgs`: one `clap` flag/env pair per
//! recognized key, durations parsed with `humantime`.

#[derive(clap::Parser, Debug, Clone, serde::Serialize)]
pub struct Config {
    /// Namespaces the cap and lease rows.
    #[clap(long, env = "SHARDLEASE_APP_NAME", default_value = "default")]
    pub app_name: String,

    /// Identity published to lease rows. Defaults to $HOSTNAME, falling
    /// back to a generated id.
    #[clap(long, env = "SHARDLEASE_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Upper bound on max_leases_per_worker (spec I6).
    #[clap(long, env = "SHARDLEASE_HARD_CAP", default_value_t = crate::cap::DEFAULT_HARD_CAP)]
    pub hard_cap: u32,

    /// Env var consulted for an explicit worker-count override (spec §4.3
    /// resolution order item 1).
    #[clap(
        long,
        env = "SHARDLEASE_WORKER_COUNT_ENV_VAR",
        default_value = "WORKER_COUNT_OVERRIDE"
    )]
    pub worker_count_env_var: String,

    /// Interval between discovery scans of lease rows.
    #[clap(long, env = "SHARDLEASE_DISCOVERY_INTERVAL", default_value = "5s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub discovery_interval: std::time::Duration,

    /// Interval between heartbeat renewals of held leases.
    #[clap(long, env = "SHARDLEASE_HEARTBEAT_INTERVAL", default_value = "3s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: std::time::Duration,

    /// How long a foreign lease's heartbeat may go stale before it is
    /// considered expired and failed-over.
    #[clap(long, env = "SHARDLEASE_FAILOVER_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub failover_timeout: std::time::Duration,

    /// How long an over-quota peer's heartbeat must be stale before this
    /// worker will steal from it (suggested 2x heartbeat_interval).
    #[clap(long, env = "SHARDLEASE_STEAL_GRACE", default_value = "6s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub steal_grace: std::time::Duration,

    /// Interval between cap re-evaluations.
    #[clap(long, env = "SHARDLEASE_CAP_REFRESH_INTERVAL", default_value = "30s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub cap_refresh_interval: std::time::Duration,

    /// Max lease acquisitions attempted per discovery tick.
    #[clap(long, env = "SHARDLEASE_STEAL_BATCH", default_value_t = 1)]
    pub steal_batch: usize,

    /// Cursor used when a lease has no checkpoint.
    #[clap(long, env = "SHARDLEASE_INITIAL_POSITION", default_value = "earliest")]
    pub initial_position: InitialPosition,

    /// Retention window after SHARD_END before a lease row is eligible
    /// for the retirement sweep (spec §4.6).
    #[clap(long, env = "SHARDLEASE_RETENTION", default_value = "24h", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub retention: std::time::Duration,

    /// Interval between retirement sweeps.
    #[clap(long, env = "SHARDLEASE_RETIREMENT_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub retirement_interval: std::time::Duration,

    /// Per-operation store timeout.
    #[clap(long, env = "SHARDLEASE_STORE_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub store_timeout: std::time::Duration,

    /// Per-operation probe timeout.
    #[clap(long, env = "SHARDLEASE_PROBE_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    #[serde(with = "humantime_serde")]
    pub probe_timeout: std::time::Duration,
}

impl Config {
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| format!("worker-{}", uuid_like_suffix()))
        })
    }
}

fn uuid_like_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8).map(|_| char::from(rng.sample(rand::distributions::Alphanumeric))).collect()
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    Earliest,
    Latest,
}

impl From<InitialPosition> for crate::model::Checkpoint {
    fn from(value: InitialPosition) -> Self {
        match value {
            // Both map to "not yet started"; the distinction is a hint
            // the Topology/stream client's pagination consumes, not a
            // persisted field (spec §6: "cursor used when a lease has no
            // checkpoint").
            InitialPosition::Earliest | InitialPosition::Latest => crate::model::Checkpoint::TrimHorizon,
        }
    }
}

impl InitialPosition {
    /// Cursor handed to `Processor::on_initialize` when a lease has no
    /// persisted checkpoint (spec §6: "cursor used when a lease has no
    /// checkpoint"). The coordinator never dereferences it; the processor's
    /// own stream client interprets `"earliest"`/`"latest"` as where to
    /// start paginating.
    pub fn cursor_hint(&self) -> &'static str {
        match self {
            InitialPosition::Earliest => "earliest",
            InitialPosition::Latest => "latest",
        }
    }
}
