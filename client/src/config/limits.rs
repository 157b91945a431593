//! Hard limits for client settings

/// Smallest prefetch window a receiver accepts
pub const MIN_PREFETCH_COUNT: u32 = 10;

/// Largest prefetch window a receiver accepts
pub const MAX_PREFETCH_COUNT: u32 = 999;

/// Maximum reasonable timeout for operations (10 minutes)
pub const MAX_OPERATION_TIMEOUT_SECS: u64 = 600;

/// Maximum number of outstanding ping credits
pub const MAX_PING_CREDITS: u32 = 10;

/// Maximum number of retries a policy may allow
pub const MAX_RETRY_COUNT: u32 = 100;

/// Maximum backoff between retries (10 minutes)
pub const MAX_BACKOFF_MS: u64 = 600_000;
