use std::time::Duration;

use crate::channel::PartitionKey;
use crate::dispatch::retry::RetryConfig;
use crate::dispatch::DispatchConfig;
use crate::logging::LogFormat;

pub const DEFAULT_GATEWAY_URL: &str = "https://graph.facebook.com/v23.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is missing")]
    Missing(&'static str),
}

/// Who this worker process is. Resolved once at the binary edge and passed
/// into the core explicitly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    /// Position among the processes sharing a topic; picks the owned partitions.
    pub index: u32,
}

impl WorkerIdentity {
    /// Explicit id wins, then the process-manager instance, then the OS pid.
    pub fn resolve(explicit: Option<String>, pm2_instance: Option<String>, pid: u32) -> Self {
        let instance = pm2_instance
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let index = instance
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let worker_id = explicit
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| instance.map(|i| format!("pm2-cluster-{i}")))
            .unwrap_or_else(|| format!("pid-{pid}"));

        Self { worker_id, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LimiterKind {
    /// Window kept in process memory.
    #[default]
    Local,
    /// Window kept in Postgres, shared by every process.
    Shared,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub partitions: u32,
    pub partition_key: PartitionKey,
    pub lease: Duration,
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub base_url: String,
    pub access_token: Option<String>,
    pub sender_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub topic: Option<String>,
    pub identity: WorkerIdentity,
    pub worker_count: u32,
    pub concurrency: usize,
    pub channel: ChannelConfig,
    pub dispatch: DispatchConfig,
    pub rate_limiter: LimiterKind,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub gateway: GatewaySettings,
    pub log_format: LogFormat,
    pub pool: PoolSettings,
}

impl Config {
    /// Loads `.env`, then reads the process environment. `topic_arg` is the
    /// topic given on the command line, used when no topic variable is set.
    pub fn from_env(topic_arg: Option<String>) -> Self {
        dotenvy::dotenv().ok();
        let mut cfg = Self::from_lookup(|key| std::env::var(key).ok());
        if cfg.topic.is_none() {
            cfg.topic = topic_arg.filter(|s| !s.trim().is_empty());
        }
        cfg
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let identity = WorkerIdentity::resolve(
            env.or_fallback("BCAST_WORKER_ID", "WORKER_ID"),
            env.get("PM2_INSTANCE_ID"),
            std::process::id(),
        );
        let identity = match env.parsed::<u32>("BCAST_WORKER_INDEX") {
            Some(index) => WorkerIdentity { index, ..identity },
            None => identity,
        };

        let worker_count = env.parsed("BCAST_WORKER_COUNT").unwrap_or(1_u32).max(1);
        let concurrency = env.parsed("BCAST_CONCURRENCY").unwrap_or(10_usize).clamp(1, 1024);

        let channel = ChannelConfig {
            partitions: env.parsed("BCAST_PARTITIONS").unwrap_or(16_u32).clamp(1, 4096),
            partition_key: env
                .get("BCAST_PARTITION_KEY")
                .and_then(|s| PartitionKey::parse(&s))
                .unwrap_or_default(),
            lease: Duration::from_secs(env.parsed("BCAST_LEASE_SECONDS").unwrap_or(30_u64).max(1)),
        };

        let dispatch = DispatchConfig {
            max_attempts: env.parsed("BCAST_MAX_ATTEMPTS").unwrap_or(3_i32).max(1),
            default_messages_per_second: env.parsed("BCAST_DEFAULT_MPS").unwrap_or(80_u32).max(1),
            send_timeout: Duration::from_millis(
                env.parsed("BCAST_SEND_TIMEOUT_MS").unwrap_or(20_000_u64).max(1),
            ),
            rate_window: Duration::from_millis(1000),
            retry: RetryConfig::default(),
        };

        let rate_limiter = match env.get("BCAST_RATE_LIMITER").as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("shared") => LimiterKind::Shared,
            _ => LimiterKind::Local,
        };

        let gateway = GatewaySettings {
            base_url: env
                .get("BCAST_GATEWAY_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            access_token: env.get("BCAST_GATEWAY_TOKEN"),
            sender_id: env.get("BCAST_GATEWAY_SENDER_ID"),
        };

        let pool = PoolSettings {
            max_connections: env.parsed("BCAST_DB_MAX_CONNECTIONS").unwrap_or(8_u32).clamp(1, 64),
            acquire_timeout: Duration::from_secs(
                env.parsed("BCAST_DB_ACQUIRE_TIMEOUT_SECS").unwrap_or(10_u64).clamp(1, 60),
            ),
        };

        Self {
            database_url: env.get("DATABASE_URL"),
            topic: env.or_fallback("BCAST_TOPIC", "TOPIC"),
            identity,
            worker_count,
            concurrency,
            channel,
            dispatch,
            rate_limiter,
            admin_addr: env
                .or_fallback("BCAST_ADMIN_ADDR", "ADMIN_ADDR")
                .and_then(|s| normalize_optional_addr(&s)),
            migrate_on_startup: env.bool("BCAST_MIGRATE_ON_STARTUP").unwrap_or(false),
            gateway,
            log_format: env
                .get("BCAST_LOG_FORMAT")
                .and_then(|s| LogFormat::parse(&s))
                .unwrap_or_default(),
            pool,
        }
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn topic(&self) -> Result<&str, ConfigError> {
        self.topic.as_deref().ok_or(ConfigError::Missing("BCAST_TOPIC"))
    }

    /// Partitions consumed by this process.
    pub fn owned_partitions(&self) -> Vec<u32> {
        crate::channel::assigned_partitions(
            self.identity.index,
            self.worker_count,
            self.channel.partitions,
        )
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|s| !s.trim().is_empty())
    }

    fn or_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|s| s.trim().parse().ok())
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
