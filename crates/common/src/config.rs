use std::time::Duration;

use serde::Deserialize;

const SECS_PER_HOUR: u64 = 3600;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Cloud Controller base URL
    pub cc_host: String,

    /// UAA base URL
    pub uaa_host: String,

    /// UAA client credentials used for user e-mail lookups
    pub uaa_client_id: String,
    pub uaa_client_secret: String,

    /// Verify TLS certificates on directory calls (default: true)
    pub verify_ssl: bool,

    /// Per-call timeout for directory HTTP requests in seconds (default: 10)
    pub directory_timeout_secs: u64,

    /// SMTP relay host and port
    pub smtp_host: String,
    pub smtp_port: u16,

    /// Optional SMTP credentials
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,

    /// Use STARTTLS when talking to the relay (default: true)
    pub smtp_tls: bool,

    /// Per-send SMTP timeout in seconds (default: 30)
    pub smtp_timeout_secs: u64,

    /// From address on every outgoing message
    pub sender: String,

    /// Secret used to encrypt auth tokens at rest
    pub encryption_key: String,

    /// 0-based index of this instance among all running instances
    pub instance_index: u32,

    /// Total number of running instances (default: 1)
    pub instance_count: u32,

    /// Delivery workers per instance (default: 10)
    pub worker_count: u32,

    /// Queue lease duration in seconds (default: 120)
    pub queue_lease_secs: u64,

    /// Idle poll interval when the queue is empty (default: 1000)
    pub queue_poll_interval_ms: u64,

    /// Retries before a job is discarded (default: 10)
    pub max_retries: u32,

    /// First retry backoff in seconds (default: 60)
    pub retry_base_secs: u64,

    /// Upper bound on retry backoff in seconds (default: 21600)
    pub retry_max_secs: u64,

    /// Message retention window in hours (default: 24)
    pub message_lifetime_hours: u64,

    /// Message GC poll interval in seconds (default: 3600)
    pub gc_interval_secs: u64,

    /// Health endpoint port (default: 3000)
    pub port: u16,

    /// Skip the SMTP startup check
    pub test_mode: bool,
}

/// The subset of `VCAP_APPLICATION` we care about.
#[derive(Debug, Deserialize)]
struct VcapApplication {
    instance_index: Option<u32>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name).ok_or_else(|| anyhow::anyhow!("{name} environment variable is required"))
        };

        let instance_index = match lookup("INSTANCE_INDEX") {
            Some(value) => value
                .parse()
                .map_err(|_| anyhow::anyhow!("INSTANCE_INDEX must be a valid u32"))?,
            None => match lookup("VCAP_APPLICATION") {
                Some(raw) => serde_json::from_str::<VcapApplication>(&raw)
                    .map_err(|e| anyhow::anyhow!("VCAP_APPLICATION is not valid JSON: {e}"))?
                    .instance_index
                    .unwrap_or(0),
                None => 0,
            },
        };

        let message_lifetime_hours: u64 = parse_or(&lookup, "MESSAGE_LIFETIME_HOURS", 24)?;
        if message_lifetime_hours.checked_mul(SECS_PER_HOUR).is_none() {
            anyhow::bail!("MESSAGE_LIFETIME_HOURS is too large: {message_lifetime_hours}");
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 20)?,
            cc_host: required("CC_HOST")?,
            uaa_host: required("UAA_HOST")?,
            uaa_client_id: required("UAA_CLIENT_ID")?,
            uaa_client_secret: required("UAA_CLIENT_SECRET")?,
            verify_ssl: parse_or(&lookup, "VERIFY_SSL", true)?,
            directory_timeout_secs: parse_or(&lookup, "DIRECTORY_TIMEOUT_SECS", 10)?,
            smtp_host: required("SMTP_HOST")?,
            smtp_port: parse_or(&lookup, "SMTP_PORT", 25)?,
            smtp_user: lookup("SMTP_USER"),
            smtp_pass: lookup("SMTP_PASS"),
            smtp_tls: parse_or(&lookup, "SMTP_TLS", true)?,
            smtp_timeout_secs: parse_or(&lookup, "SMTP_TIMEOUT_SECS", 30)?,
            sender: required("SENDER")?,
            encryption_key: required("ENCRYPTION_KEY")?,
            instance_index,
            instance_count: parse_or(&lookup, "INSTANCE_COUNT", 1)?,
            worker_count: parse_or(&lookup, "WORKER_COUNT", 10)?,
            queue_lease_secs: parse_or(&lookup, "QUEUE_LEASE_SECS", 120)?,
            queue_poll_interval_ms: parse_or(&lookup, "QUEUE_POLL_INTERVAL_MS", 1000)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", 10)?,
            retry_base_secs: parse_or(&lookup, "RETRY_BASE_SECS", 60)?,
            retry_max_secs: parse_or(&lookup, "RETRY_MAX_SECS", 21_600)?,
            message_lifetime_hours,
            gc_interval_secs: parse_or(&lookup, "GC_INTERVAL_SECS", 3600)?,
            port: parse_or(&lookup, "PORT", 3000)?,
            test_mode: parse_or(&lookup, "TEST_MODE", false)?,
        })
    }

    pub fn queue_lease(&self) -> Duration {
        Duration::from_secs(self.queue_lease_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn message_lifetime(&self) -> Duration {
        Duration::from_secs(self.message_lifetime_hours.saturating_mul(SECS_PER_HOUR))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{name} must be a valid {}",
                std::any::type_name::<T>()
            )
        }),
        None => Ok(default),
    }
}
