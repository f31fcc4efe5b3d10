use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::Shared;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelGroup;
use crate::error::{CacheError, CacheResult};

/// Broadcast channel for one settlement: every caller of an in-flight fetch
/// awaits a clone of this and observes the same outcome.
pub(crate) type SettleChannel<V> = Shared<oneshot::Receiver<CacheResult<V>>>;

/// Per-key record of one in-flight fetch.
pub(crate) struct Flight<V> {
    /// The shared settlement.
    pub(crate) channel: SettleChannel<V>,
    /// All-of reduction over the callers currently attached to this fetch.
    pub(crate) group: Arc<CancelGroup>,
    /// Distinguishes this fetch from anything installed for the key later;
    /// a settling fetch only touches the store if its id still matches.
    pub(crate) id: u64,
}

/// Creates the settlement channel for a new flight.
pub(crate) fn flight_channel<V: Clone>() -> (oneshot::Sender<CacheResult<V>>, SettleChannel<V>) {
    let (sender, receiver) = oneshot::channel();
    (sender, receiver.shared())
}

/// Waits for a settlement on behalf of one caller.
///
/// The channel is polled before the caller's token, so while the caller is
/// actively awaiting, a settlement and a cancellation race in arrival
/// order: a fetch that completes first wins over a token fired later, and a
/// token fired while the fetch is still pending yields `Cancelled` even if
/// other callers keep the fetch alive to completion.
///
/// A dropped channel means the flight was dismantled without settling; that
/// is reported as `Cancelled` as well.
pub(crate) async fn await_outcome<V: Clone>(
    channel: SettleChannel<V>,
    token: CancellationToken,
) -> CacheResult<V> {
    tokio::select! {
        biased;
        settled = channel => settled.unwrap_or(Err(CacheError::Cancelled)),
        _ = token.cancelled() => Err(CacheError::Cancelled),
    }
}
