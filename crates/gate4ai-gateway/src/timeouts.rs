use std::time::Duration;

/// Every duration the core uses, declared in one place.
///
/// The gateway deliberately has no per-call timeout knobs scattered through
/// the modules: sessions, pools and handlers all receive one `Timeouts` value
/// at construction and read from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on `open()`: SSE connect, endpoint event and `initialize`.
    pub open: Duration,
    /// Bound on a single upstream request (POST + correlated response).
    pub request: Duration,
    /// Bound on one backend's list fetch during aggregation.
    pub list_fetch: Duration,
    /// Freshness window for the session pool and the per-kind list caches.
    pub cache_ttl: Duration,
    /// Tick of the correlator's deadline sweeper.
    pub sweep_interval: Duration,
    /// First delay of the SSE reconnect backoff.
    pub sse_retry_min: Duration,
    /// Ceiling of the SSE reconnect backoff.
    pub sse_retry_max: Duration,
}

impl Timeouts {
    pub const DEFAULT_OPEN: Duration = Duration::from_secs(15);
    pub const DEFAULT_REQUEST: Duration = Duration::from_secs(30);
    pub const DEFAULT_LIST_FETCH: Duration = Duration::from_secs(10);
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);
    pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
    pub const DEFAULT_SSE_RETRY_MIN: Duration = Duration::from_secs(1);
    pub const DEFAULT_SSE_RETRY_MAX: Duration = Duration::from_secs(30);
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: Self::DEFAULT_OPEN,
            request: Self::DEFAULT_REQUEST,
            list_fetch: Self::DEFAULT_LIST_FETCH,
            cache_ttl: Self::DEFAULT_CACHE_TTL,
            sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
            sse_retry_min: Self::DEFAULT_SSE_RETRY_MIN,
            sse_retry_max: Self::DEFAULT_SSE_RETRY_MAX,
        }
    }
}
