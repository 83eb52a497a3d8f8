//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use crate::config::StoreKind;

/// Runtime counters tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being handled. Reported when the drain deadline
    /// expires so operators can see what was cut off.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub enum ServiceState {
    /// Loading config
    Initializing,
    /// Loading (or creating) the task store
    OpeningStore { listen_addr: SocketAddr },
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Accepting requests
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

#[derive(Debug)]
pub enum ServiceEvent {
    ConfigLoaded {
        listen_addr: SocketAddr,
        store: StoreKind,
    },
    StoreReady,
    StoreFailed(String),
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every in-flight request finished
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
}

#[derive(Debug, PartialEq)]
pub enum ServiceAction {
    OpenStore { kind: StoreKind },
    StartListener { addr: SocketAddr },
    /// Stop accepting and wait for in-flight requests until `deadline`
    Drain { deadline: Instant },
    Shutdown { exit_code: i32 },
    None,
}

/// Time allowed for in-flight requests after a shutdown signal
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr, store }) => (
            ServiceState::OpeningStore { listen_addr },
            ServiceAction::OpenStore { kind: store },
        ),

        (ServiceState::OpeningStore { listen_addr }, ServiceEvent::StoreReady) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        // A corrupt or unwritable store is a config problem; retrying won't fix it
        (ServiceState::OpeningStore { .. }, ServiceEvent::StoreFailed(_)) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => {
            (ServiceState::Running { listen_addr }, ServiceAction::None)
        }

        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            (
                ServiceState::Draining { deadline },
                ServiceAction::Drain { deadline },
            )
        }

        (ServiceState::Draining { .. }, ServiceEvent::Drained | ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // Invalid/unhandled transition: stay in current state
        (state, _event) => (state, ServiceAction::None),
    }
}
