//! Engine lifecycle state and in-flight exchange tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and a concurrent table of
//! per-exchange cancellation tokens. Entries are removed by RAII guards, so
//! the table stays accurate even if a routing task panics.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use switchyard_core::ExchangeId;
use tokio_util::sync::CancellationToken;

/// Engine lifecycle.
///
/// State machine: Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting and routing exchanges.
    Running,
    /// Rejecting new exchanges while in-flight ones finish.
    Draining,
    /// No exchange is in flight and none will be accepted.
    Stopped,
}

#[derive(Debug)]
pub(crate) struct InFlightTracker {
    exchanges: Arc<DashMap<ExchangeId, CancellationToken>>,
    state: ArcSwap<EngineState>,
}

impl InFlightTracker {
    pub(crate) fn new() -> Self {
        Self {
            exchanges: Arc::new(DashMap::new()),
            state: ArcSwap::from_pointee(EngineState::Running),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        **self.state.load()
    }

    pub(crate) fn begin_draining(&self) {
        self.state.store(Arc::new(EngineState::Draining));
    }

    /// Tracks exchange `id` until the returned guard drops.
    pub(crate) fn track(&self, id: ExchangeId, token: CancellationToken) -> InFlightGuard {
        self.exchanges.insert(id, token);
        InFlightGuard {
            exchanges: Arc::clone(&self.exchanges),
            id,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.exchanges.len()
    }

    /// Cancels exchange `id`. Returns `false` if it is not in flight.
    pub(crate) fn cancel(&self, id: ExchangeId) -> bool {
        match self.exchanges.get(&id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Waits for all in-flight exchanges to finish, up to `timeout`.
    ///
    /// Returns `true` (and moves to `Stopped`) if the table drained in time.
    /// On timeout the state stays `Draining`.
    pub(crate) async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.exchanges.is_empty() {
                self.state.store(Arc::new(EngineState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Removes its exchange from the in-flight table when dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    exchanges: Arc<DashMap<ExchangeId, CancellationToken>>,
    id: ExchangeId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.exchanges.remove(&self.id);
    }
}
