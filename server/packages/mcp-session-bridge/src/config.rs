use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 180_000;
pub const DEFAULT_INITIALIZATION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SESSION_IDLE_TIMEOUT_MS: u64 = 1_800_000;
pub const DEFAULT_SESSION_MAX_LIFETIME_MS: u64 = 3_600_000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_SESSION_CHECK_INTERVAL_MS: u64 = 60_000;

/// Delay between `notifications/initialized` and the tools-changed push.
pub const TOOLS_CHANGED_DELAY: Duration = Duration::from_millis(500);

/// Timing knobs for sessions and requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub request_timeout: Duration,
    pub initialization_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub session_max_lifetime: Duration,
    pub keepalive_interval: Duration,
    pub session_check_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            initialization_timeout: Duration::from_millis(DEFAULT_INITIALIZATION_TIMEOUT_MS),
            session_idle_timeout: Duration::from_millis(DEFAULT_SESSION_IDLE_TIMEOUT_MS),
            session_max_lifetime: Duration::from_millis(DEFAULT_SESSION_MAX_LIFETIME_MS),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            session_check_interval: Duration::from_millis(DEFAULT_SESSION_CHECK_INTERVAL_MS),
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by `MCP_TOOL_TIMEOUT`, `MCP_INIT_TIMEOUT`, `SESSION_IDLE_TIMEOUT`,
    /// `SESSION_MAX_LIFETIME`, `KEEPALIVE_INTERVAL` and `SESSION_CHECK_INTERVAL` (milliseconds).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |key: &str, default: Duration| duration_from_ms(lookup(key), default);
        Self {
            request_timeout: read("MCP_TOOL_TIMEOUT", defaults.request_timeout),
            initialization_timeout: read("MCP_INIT_TIMEOUT", defaults.initialization_timeout),
            session_idle_timeout: read("SESSION_IDLE_TIMEOUT", defaults.session_idle_timeout),
            session_max_lifetime: read("SESSION_MAX_LIFETIME", defaults.session_max_lifetime),
            keepalive_interval: read("KEEPALIVE_INTERVAL", defaults.keepalive_interval),
            session_check_interval: read(
                "SESSION_CHECK_INTERVAL",
                defaults.session_check_interval,
            ),
        }
    }
}

fn duration_from_ms(raw: Option<String>, default: Duration) -> Duration {
    raw.and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
