//! Default values for optional [`crate::Config`] fields.

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 8;
pub const DEFAULT_DRAW_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DRAW_BACKOFF_BASE_MS: u64 = 50;
pub const DEFAULT_DRAW_BACKOFF_MAX_MS: u64 = 1_000;
pub const DEFAULT_DRAW_BACKOFF_JITTER: bool = false;
pub const DEFAULT_CONFIG_CACHE_TTL_MS: u64 = 5_000;
pub const DEFAULT_WORKER_THREADS: usize = 4;
