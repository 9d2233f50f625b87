//! Per-endpoint circuit state
//!
//! closed -> open after `failure_threshold` consecutive transient verdicts,
//! open -> half-open once the cooldown elapses, half-open -> closed on the
//! next success or back to open on the next transient failure. A
//! feature-unavailable verdict disables the endpoint for the session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

/// Derived phase of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
    Disabled,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "closed"),
            CircuitPhase::Open => write!(f, "open"),
            CircuitPhase::HalfOpen => write!(f, "half-open"),
            CircuitPhase::Disabled => write!(f, "disabled"),
        }
    }
}

/// Bookkeeping for one logical endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_transient_failures: u32,
    pub opened_at: Option<Instant>,
    pub next_probe_at: Option<Instant>,
    pub disabled: bool,
}

impl CircuitState {
    pub fn phase(&self, now: Instant) -> CircuitPhase {
        if self.disabled {
            return CircuitPhase::Disabled;
        }
        match self.next_probe_at {
            None => CircuitPhase::Closed,
            Some(probe_at) if now >= probe_at => CircuitPhase::HalfOpen,
            Some(_) => CircuitPhase::Open,
        }
    }

    /// Record a success. Returns true if a previously opened circuit closed.
    pub fn record_ok(&mut self) -> bool {
        let recovered = self.opened_at.is_some();
        self.consecutive_transient_failures = 0;
        self.opened_at = None;
        self.next_probe_at = None;
        recovered
    }

    /// Record a transient failure. Returns true if the circuit (re)opened.
    pub fn record_transient(&mut self, now: Instant, config: &CircuitConfig) -> bool {
        let was_half_open = self.phase(now) == CircuitPhase::HalfOpen;
        self.consecutive_transient_failures = self.consecutive_transient_failures.saturating_add(1);

        if was_half_open || self.consecutive_transient_failures >= config.failure_threshold {
            self.opened_at = Some(now);
            self.next_probe_at = Some(now + config.cooldown);
            true
        } else {
            false
        }
    }

    pub fn disable(&mut self) {
        self.disabled = true;
        self.opened_at = None;
        self.next_probe_at = None;
    }
}

/// Circuit lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    Opened { key: String },
    Recovered { key: String },
    Disabled { key: String },
}

/// Serializable view of one circuit for the status API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub phase: CircuitPhase,
    pub consecutive_transient_failures: u32,
    /// Milliseconds until the next probe, while open
    pub next_probe_in_ms: Option<u64>,
}

/// Explicit map of circuit states, owned by one dispatcher
pub struct CircuitRegistry {
    config: CircuitConfig,
    states: Mutex<HashMap<String, CircuitState>>,
    events: broadcast::Sender<CircuitEvent>,
}

impl fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("config", &self.config)
            .field("circuits", &self.lock().len())
            .finish()
    }
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to circuit lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self, key: &str) -> CircuitPhase {
        self.lock()
            .get(key)
            .map(|state| state.phase(Instant::now()))
            .unwrap_or(CircuitPhase::Closed)
    }

    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.lock().get(key).cloned()
    }

    pub fn record_ok(&self, key: &str) {
        let recovered = match self.lock().get_mut(key) {
            Some(state) => state.record_ok(),
            None => false,
        };
        if recovered {
            info!("Circuit '{}' recovered", key);
            let _ = self.events.send(CircuitEvent::Recovered {
                key: key.to_string(),
            });
        }
    }

    /// Record a transient failure and return the resulting phase
    pub fn record_transient(&self, key: &str) -> CircuitPhase {
        let now = Instant::now();
        let (opened, phase, failures) = {
            let mut states = self.lock();
            let state = states.entry(key.to_string()).or_default();
            let opened = state.record_transient(now, &self.config);
            (opened, state.phase(now), state.consecutive_transient_failures)
        };
        if opened {
            warn!(
                "Circuit '{}' opened after {} consecutive transient failures",
                key, failures
            );
            let _ = self.events.send(CircuitEvent::Opened {
                key: key.to_string(),
            });
        }
        phase
    }

    pub fn disable(&self, key: &str) {
        let newly_disabled = {
            let mut states = self.lock();
            let state = states.entry(key.to_string()).or_default();
            let was_disabled = state.disabled;
            state.disable();
            !was_disabled
        };
        if newly_disabled {
            info!(
                "Endpoint '{}' is not available on this backend, disabling",
                key
            );
            let _ = self.events.send(CircuitEvent::Disabled {
                key: key.to_string(),
            });
        }
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut circuits: Vec<CircuitSnapshot> = self
            .lock()
            .iter()
            .map(|(key, state)| CircuitSnapshot {
                key: key.clone(),
                phase: state.phase(now),
                consecutive_transient_failures: state.consecutive_transient_failures,
                next_probe_in_ms: state
                    .next_probe_at
                    .filter(|at| *at > now)
                    .map(|at| (at - now).as_millis() as u64),
            })
            .collect();
        circuits.sort_by(|a, b| a.key.cmp(&b.key));
        circuits
    }
}
