//! In-flight set: per-key single-flight coordination.
//!
//! The first caller to [`FlightSet::claim`] a key becomes its producer and
//! receives a [`FlightGuard`]; everyone else receives a [`Waiter`] parked on
//! that key's watch channel. The map shard lock is held only for the
//! synchronous test-and-set, never across an `.await`, so unrelated keys never
//! block each other.
//!
//! Dropping a guard without calling [`FlightGuard::finish`] (for example when
//! the producer's request is cancelled) removes the key and publishes
//! [`ProxyError::Cancelled`], so a key can never be stuck pending. Guards
//! own a handle to the set, so a producer can hand its guard to a detached
//! task that outlives the request.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::error::ProxyError;

/// Progress of one flight, as seen by its waiters.
#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    Succeeded,
    Failed(ProxyError),
}

type Flights = DashMap<String, watch::Receiver<FlightState>>;

/// Set of keys currently being produced.
#[derive(Default)]
pub struct FlightSet {
    flights: Arc<Flights>,
}

/// Outcome of claiming a key.
pub enum Claim {
    /// Caller must produce the value and report through the guard.
    Producer(FlightGuard),
    /// Another caller is producing; wait for its outcome.
    Waiter(Waiter),
}

impl FlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically test-and-set `key`.
    pub fn claim(&self, key: &str) -> Claim {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(entry) => Claim::Waiter(Waiter {
                rx: entry.get().clone(),
            }),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(FlightState::Pending);
                entry.insert(rx);
                Claim::Producer(FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key: key.to_string(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Whether `key` is currently being produced.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of keys currently being produced.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

impl std::fmt::Debug for FlightSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightSet")
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

/// Producer side of a flight.
pub struct FlightGuard {
    flights: Arc<Flights>,
    key: String,
    tx: Option<watch::Sender<FlightState>>,
}

impl FlightGuard {
    /// Clear the in-flight marker and publish the producer's outcome.
    pub fn finish(mut self, outcome: Result<(), ProxyError>) {
        let state = match outcome {
            Ok(()) => FlightState::Succeeded,
            Err(e) => FlightState::Failed(e),
        };
        self.publish(state);
    }

    fn publish(&mut self, state: FlightState) {
        if let Some(tx) = self.tx.take() {
            self.flights.remove(&self.key);
            // No receivers left just means nobody was waiting.
            let _ = tx.send(state);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(key = %self.key, "producer dropped before finishing");
            self.publish(FlightState::Failed(ProxyError::Cancelled));
        }
    }
}

/// Waiter side of a flight.
pub struct Waiter {
    rx: watch::Receiver<FlightState>,
}

impl Waiter {
    /// Park until the producer finishes and return its outcome.
    ///
    /// Dropping the returned future only drops this waiter's receiver; the
    /// producer is unaffected.
    pub async fn wait(mut self) -> Result<(), ProxyError> {
        let state = match self
            .rx
            .wait_for(|s| !matches!(s, FlightState::Pending))
            .await
        {
            Ok(state) => (*state).clone(),
            Err(_) => FlightState::Failed(ProxyError::Cancelled),
        };
        match state {
            FlightState::Failed(e) => Err(e),
            FlightState::Pending | FlightState::Succeeded => Ok(()),
        }
    }
}
