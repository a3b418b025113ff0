//! System configuration and environment variable parsing.
//!
//! Fixed protocol constants live here as `const`s. Everything an operator may
//! want to tune is read from the environment through the `from_env()`
//! constructors on the structured config types.

use std::time::Duration;

/// Upstream feed WebSocket endpoint
pub const FEED_WS_URL: &str = "wss://feed.venue-live.example/socket";

/// Client app version reported in the connect query string and frame headers
pub const APP_VERSION: &str = "7.42.0";

/// Heartbeat interval (seconds). Upstream drops the session after ~35s of silence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// No inbound frame for this long means the connection is dead (seconds)
pub const FEED_STALE_SECS: u64 = 90;

/// WebSocket connect timeout (seconds)
pub const FEED_CONNECT_TIMEOUT_SECS: u64 = 10;

/// WebSocket reconnect delay (seconds)
pub const WS_RECONNECT_DELAY_SECS: u64 = 5;

/// Probe stake in cents used to capture a locked request ($0.20)
pub const PROBE_STAKE_CENTS: u32 = 20;

/// Retry bound for Unauthorized / RateLimited placements
pub const MAX_PLACEMENT_RETRIES: u32 = 3;

/// First backoff delay (milliseconds), doubled on each retry
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Backoff ceiling (milliseconds)
pub const BACKOFF_CAP_MS: u64 = 10_000;

/// Priority subscription lifetime (seconds)
pub const PRIORITY_TTL_SECS: u64 = 30;

/// Priority subscription refresh cadence (milliseconds)
pub const PRIORITY_REFRESH_MS: u64 = 1_000;

/// Per-consumer push buffer. Pushes beyond this are dropped for that consumer.
pub const CONSUMER_BUFFER: usize = 1024;

/// Upstream confirmation codes observed on accepted placements.
/// Reverse-engineered from production traffic; keep this list in sync with the venue.
pub const DEFAULT_ACCEPTED_CODES: &[i64] = &[0, 1, 100, 200];

/// Read a boolean toggle from the environment ("1" or "true"), cached after first read.
macro_rules! env_toggle {
    ($name:ident, $var:literal, $default:expr) => {
        pub fn $name() -> bool {
            static CACHED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
            *CACHED.get_or_init(|| {
                std::env::var($var)
                    .map(|v| v == "1" || v.to_lowercase() == "true")
                    .unwrap_or($default)
            })
        }
    };
}

// Dry run (set DRY_RUN=0 to place real bets through the session bridge)
env_toggle!(dry_run_enabled, "DRY_RUN", true);

// Log every decoded frame's message name (set FEED_TRACE=1 to enable)
env_toggle!(feed_trace_enabled, "FEED_TRACE", false);

// Inject a synthetic dispatch 10s after startup (set TEST_DISPATCH=1 to enable)
env_toggle!(test_dispatch_enabled, "TEST_DISPATCH", false);

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Identity and connection parameters for one upstream feed session.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub device_id: String,
    pub session_id: String,
    pub install_token: String,
    pub session_token: String,
    pub auth_token: String,
    pub client_ip: String,
    pub app_version: String,
    /// Sequence number of the first outbound frame
    pub start_seq: u64,
    pub heartbeat_interval: Duration,
    /// Channels subscribed immediately after connecting
    pub channels: Vec<String>,
    /// Subscribe to each live event's subfeed the first time it is seen
    pub auto_subscribe_live: bool,
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let heartbeat_secs: u64 = env_parse("FEED_HEARTBEAT_SECS", HEARTBEAT_INTERVAL_SECS);
        Self {
            endpoint: env_string("FEED_WS_URL", FEED_WS_URL),
            device_id: env_string("FEED_DEVICE_ID", "odds-relay-0"),
            session_id: env_string("FEED_SESSION_ID", "relay"),
            install_token: env_string("FEED_INSTALL_TOKEN", ""),
            session_token: env_string("FEED_SESSION_TOKEN", ""),
            auth_token: env_string("FEED_AUTH_TOKEN", ""),
            client_ip: env_string("FEED_CLIENT_IP", "127.0.0.1"),
            app_version: env_string("FEED_APP_VERSION", APP_VERSION),
            start_seq: env_parse("FEED_START_SEQ", 1),
            heartbeat_interval: heartbeat_interval(heartbeat_secs),
            channels: env_string("FEED_CHANNELS", "inplay_conflicts,prematch_conflicts")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            auto_subscribe_live: std::env::var("FEED_AUTO_SUBSCRIBE")
                .map(|v| v == "1" || v == "true")
                .unwrap_or(true),
        }
    }
}

/// Upstream tolerates 25-30s; anything outside that risks a timeout.
pub fn heartbeat_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(25, 30))
}

/// Odds repository tuning.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Price moves at or above this magnitude are logged
    pub delta_log_threshold: i32,
    /// Lines not updated within this window are hidden from reads
    pub stale_after: Duration,
}

impl RepositoryConfig {
    pub fn from_env() -> Self {
        Self {
            delta_log_threshold: env_parse("ODDS_DELTA_LOG_THRESHOLD", 20),
            stale_after: Duration::from_secs(env_parse("ODDS_STALE_SECS", 600)),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            delta_log_threshold: 20,
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Bet dispatch tuning.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Upper bound on a single upstream placement call
    pub placement_timeout: Duration,
    /// How long a UI-facing caller waits before getting a pending handle
    pub caller_budget: Duration,
    pub probe_stake_cents: u32,
    pub accepted_codes: Vec<i64>,
}

impl DispatchConfig {
    pub fn from_env() -> Self {
        let accepted_codes = std::env::var("DISPATCH_ACCEPTED_CODES")
            .ok()
            .map(|v| {
                v.split(',')
                    .filter_map(|c| c.trim().parse::<i64>().ok())
                    .collect::<Vec<_>>()
            })
            .filter(|codes| !codes.is_empty())
            .unwrap_or_else(|| DEFAULT_ACCEPTED_CODES.to_vec());

        Self {
            max_retries: env_parse("DISPATCH_MAX_RETRIES", MAX_PLACEMENT_RETRIES),
            backoff_base: Duration::from_millis(env_parse("DISPATCH_BACKOFF_BASE_MS", BACKOFF_BASE_MS)),
            backoff_cap: Duration::from_millis(env_parse("DISPATCH_BACKOFF_CAP_MS", BACKOFF_CAP_MS)),
            placement_timeout: Duration::from_millis(env_parse("DISPATCH_PLACEMENT_TIMEOUT_MS", 15_000)),
            caller_budget: Duration::from_millis(env_parse("DISPATCH_CALLER_BUDGET_MS", 1_500)),
            probe_stake_cents: env_parse("DISPATCH_PROBE_STAKE_CENTS", PROBE_STAKE_CENTS),
            accepted_codes,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_PLACEMENT_RETRIES,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(BACKOFF_CAP_MS),
            placement_timeout: Duration::from_millis(15_000),
            caller_budget: Duration::from_millis(1_500),
            probe_stake_cents: PROBE_STAKE_CENTS,
            accepted_codes: DEFAULT_ACCEPTED_CODES.to_vec(),
        }
    }
}

/// Audit log storage settings.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub db_path: String,
    /// Most recent N placement records kept on disk
    pub retention: usize,
}

impl AuditConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("AUDIT_DB_PATH", "bets.db"),
            retention: env_parse("AUDIT_RETENTION", 500),
        }
    }
}

/// Base URL of the browser-automation sidecar that owns the betting sessions.
pub fn session_bridge_url() -> String {
    env_string("SESSION_BRIDGE_URL", "http://127.0.0.1:7300")
}
