//! Default values for client settings

pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PREFETCH_COUNT: u32 = 300;
pub const DEFAULT_PING_IDLE_THRESHOLD_SECS: u64 = 20;
pub const DEFAULT_MAX_PING_CREDITS: u32 = 1;
pub const DEFAULT_LINK_CLOSE_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_MIN_BACKOFF_MS: u64 = 0;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;

/// Prefix for environment overrides, e.g. `HUBSTREAM__PREFETCH_COUNT`
pub const ENV_PREFIX: &str = "HUBSTREAM";
pub const ENV_SEPARATOR: &str = "__";
