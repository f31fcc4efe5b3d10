use std::time::Duration;

use serde::Deserialize;

/// Per-cache expiry and capacity policy.
///
/// All fields are optional; the default configuration never expires and
/// never evicts.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries expire this long after insertion, or after the last
    /// successful read when `rolling_expiration` is set. Absent means no
    /// expiry.
    #[serde(with = "humantime_serde")]
    pub expiration: Option<Duration>,

    /// Measure `expiration` from the last successful read instead of from
    /// insertion. A read then also moves the entry to the back of the
    /// eviction order, turning the capacity bound from FIFO into LRU.
    pub rolling_expiration: bool,

    /// Upper bound on the number of entries. After every insertion the
    /// oldest entries are evicted until the bound holds. Absent means
    /// unbounded. Values below 1 are treated as 1.
    pub max_entries: Option<usize>,
}
