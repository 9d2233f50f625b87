//! Retry dispatcher
//!
//! Wraps transport attempts with classification, bounded exponential
//! backoff and the per-endpoint circuit. Every call resolves to a typed
//! `Result`; expected failures never panic or propagate as faults.
//!
//! At most one attempt sequence runs per endpoint key. A read issued while
//! another read is in flight joins it. Anything else waits for the running
//! sequence to settle and then runs its own, so a read never receives a
//! mutation's response.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;
use crate::circuit::{CircuitConfig, CircuitPhase, CircuitRegistry};
use crate::classifier::{self, EndpointPolicy, Verdict};
use crate::error::ClassifiedError;
use crate::io::RequestOutcome;

/// Outcome of a dispatch
pub type DispatchResult = std::result::Result<Value, ClassifiedError>;

/// Retry and classification policy for one call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub endpoint: EndpointPolicy,
}

impl DispatchPolicy {
    pub fn new(retry: RetryPolicy, endpoint: EndpointPolicy) -> Self {
        Self { retry, endpoint }
    }
}

type Waiters = Vec<oneshot::Sender<DispatchResult>>;

/// Kind of attempt sequence running on a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Idempotent read; concurrent reads share one result
    Read,
    /// Mutation; never shared
    Exclusive,
}

struct Flight {
    mode: Mode,
    waiters: Waiters,
}

/// Owns the circuit registry and the in-flight table
pub struct Dispatcher {
    circuits: CircuitRegistry,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("circuits", &self.circuits)
            .field("in_flight", &self.lock_in_flight().len())
            .finish()
    }
}

/// Removes the in-flight entry when the leading call finishes or is dropped
struct InFlightGuard<'a> {
    dispatcher: &'a Dispatcher,
    key: &'a str,
    settled: bool,
}

impl InFlightGuard<'_> {
    fn settle(mut self, result: &DispatchResult) {
        self.settled = true;
        let waiters = self
            .dispatcher
            .lock_in_flight()
            .remove(self.key)
            .map(|flight| flight.waiters)
            .unwrap_or_default();
        if !waiters.is_empty() {
            debug!(
                "Releasing {} caller(s) waiting on '{}'",
                waiters.len(), self.key
            );
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // Dropping the senders wakes joined callers with a cancellation.
            self.dispatcher.lock_in_flight().remove(self.key);
        }
    }
}

enum Claim {
    Leader,
    /// Shares the running read's result
    Joined(oneshot::Receiver<DispatchResult>),
    /// Wakes when the running sequence settles; its result is not ours
    Queued(oneshot::Receiver<DispatchResult>),
}

impl Dispatcher {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            circuits: CircuitRegistry::new(config),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Flight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an attempt sequence is currently running for `key`
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.lock_in_flight().contains_key(key)
    }

    fn claim(&self, key: &str, mode: Mode) -> Claim {
        let mut in_flight = self.lock_in_flight();
        match in_flight.get_mut(key) {
            Some(flight) => {
                let (tx, rx) = oneshot::channel();
                flight.waiters.push(tx);
                if mode == Mode::Read && flight.mode == Mode::Read {
                    Claim::Joined(rx)
                } else {
                    Claim::Queued(rx)
                }
            }
            None => {
                in_flight.insert(
                    key.to_string(),
                    Flight {
                        mode,
                        waiters: Vec::new(),
                    },
                );
                Claim::Leader
            }
        }
    }

    /// Dispatch a read, joining an in-flight read for the same key
    ///
    /// A read that finds a mutation in flight waits for it and then issues
    /// its own request.
    pub async fn dispatch<F, Fut>(
        &self,
        key: &str,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
        attempt: F,
    ) -> DispatchResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RequestOutcome>,
    {
        loop {
            match self.claim(key, Mode::Read) {
                Claim::Leader => return self.lead(key, Mode::Read, policy, cancel, attempt).await,
                Claim::Joined(rx) => {
                    debug!("Joining in-flight read for '{}'", key);
                    return tokio::select! {
                        result = rx => {
                            result.unwrap_or_else(|_| Err(ClassifiedError::cancelled(key)))
                        }
                        _ = cancel.cancelled() => Err(ClassifiedError::cancelled(key)),
                    };
                }
                Claim::Queued(rx) => {
                    debug!("Read of '{}' waiting for an in-flight mutation", key);
                    tokio::select! {
                        _ = rx => {}
                        _ = cancel.cancelled() => return Err(ClassifiedError::cancelled(key)),
                    }
                }
            }
        }
    }

    /// Dispatch a mutation: never shares results, never overlaps per key
    pub async fn dispatch_exclusive<F, Fut>(
        &self,
        key: &str,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
        attempt: F,
    ) -> DispatchResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RequestOutcome>,
    {
        loop {
            match self.claim(key, Mode::Exclusive) {
                Claim::Leader => {
                    return self
                        .lead(key, Mode::Exclusive, policy, cancel, attempt)
                        .await;
                }
                Claim::Joined(rx) | Claim::Queued(rx) => {
                    debug!("Waiting for in-flight request on '{}' to settle", key);
                    tokio::select! {
                        _ = rx => {}
                        _ = cancel.cancelled() => return Err(ClassifiedError::cancelled(key)),
                    }
                }
            }
        }
    }

    /// Dispatch a read and decode its payload; `None` for an empty payload
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &str,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
        attempt: F,
    ) -> std::result::Result<Option<T>, ClassifiedError>
    where
        T: DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = RequestOutcome>,
    {
        let value = self.dispatch(key, policy, cancel, attempt).await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ClassifiedError::fatal(key, format!("unexpected response shape: {}", e)))
    }

    async fn lead<F, Fut>(
        &self,
        key: &str,
        mode: Mode,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
        attempt: F,
    ) -> DispatchResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RequestOutcome>,
    {
        let guard = InFlightGuard {
            dispatcher: self,
            key,
            settled: false,
        };
        let result = self.run_attempts(key, mode, policy, cancel, attempt).await;
        guard.settle(&result);
        result
    }

    async fn run_attempts<F, Fut>(
        &self,
        key: &str,
        mode: Mode,
        policy: &DispatchPolicy,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> DispatchResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RequestOutcome>,
    {
        let retry = &policy.retry;
        let mut attempts_made = 0u32;

        loop {
            match self.circuits.phase(key) {
                CircuitPhase::Disabled => {
                    return Err(ClassifiedError::unavailable(
                        key,
                        "feature not available on this backend",
                    ));
                }
                CircuitPhase::Open => {
                    debug!("Circuit for '{}' is open, not attempting", key);
                    return Err(ClassifiedError::transient(key, "circuit open"));
                }
                CircuitPhase::HalfOpen => debug!("Probing '{}' after cooldown", key),
                CircuitPhase::Closed => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Request for '{}' cancelled", key);
                    return Err(ClassifiedError::cancelled(key));
                }
                outcome = attempt() => outcome,
            };
            attempts_made += 1;

            let verdict = classifier::classify(&outcome, &policy.endpoint);
            debug!(
                "Attempt {} for '{}': {} -> {:?}",
                attempts_made, key, outcome, verdict
            );

            match verdict {
                Verdict::Ok => {
                    self.circuits.record_ok(key);
                    return classifier::payload(key, &outcome);
                }
                Verdict::FeatureUnavailable => {
                    // A mutation's 404 says nothing about the endpoint's reads
                    if mode == Mode::Read {
                        self.circuits.disable(key);
                    } else {
                        debug!("Mutation on '{}' is not available: {}", key, outcome);
                    }
                    return Err(classifier::to_error(key, verdict, &outcome));
                }
                Verdict::Fatal => {
                    return Err(classifier::to_error(key, verdict, &outcome));
                }
                Verdict::Transient => {
                    let phase = self.circuits.record_transient(key);
                    if phase == CircuitPhase::Open || !retry.allows_another(attempts_made) {
                        warn!(
                            "Giving up on '{}' after {} attempts: {}",
                            key, attempts_made, outcome
                        );
                        return Err(classifier::to_error(key, verdict, &outcome));
                    }

                    let delay = retry.delay_with_hint(
                        attempts_made - 1,
                        classifier::retry_after_hint(&outcome),
                    );
                    debug!("Retrying '{}' in {:?}", key, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!("Backoff for '{}' cancelled", key);
                            return Err(ClassifiedError::cancelled(key));
                        }
                    }
                }
            }
        }
    }
}
