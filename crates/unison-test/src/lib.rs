//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This sets up `tracing` so that all
//!    console output is captured by the test runner.
//!
//!  - Hold a [`Gate`] in a variable for the whole test; fetchers blocked on
//!    a dropped gate would never be released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Sets up the test environment.
///
/// Initializes logs: the logger only captures output from this workspace's
/// crates and mutes everything else.
pub fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        fmt()
            .with_env_filter(EnvFilter::new("unison_cache=trace"))
            .with_test_writer()
            .init();
    });
}

/// A manually released barrier for holding a fetch open.
///
/// Starts closed; [`wait`](Self::wait) resolves once [`open`](Self::open)
/// has been called. Clones share state, so a test can keep one end and hand
/// the other to a fetcher.
#[derive(Clone, Debug)]
pub struct Gate {
    sender: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Gate {
            sender: Arc::new(sender),
        }
    }

    /// Releases every current and future waiter.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    /// Resolves once the gate has been opened.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender cannot be gone while `self` exists
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared invocation counter for fetchers under test.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments and returns the previous count.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
