//! Per-plugin circuit breaker
//!
//! Sheds request-driven load from a plugin with sustained failures.
//!
//! ```text
//!   Closed ──(threshold consecutive failures)──► Open
//!     ▲                                           │ reset interval since last failure
//!     │ probe succeeds                            ▼
//!     └──────────────────────────────────────── HalfOpen ──(probe fails)──► Open
//! ```
//!
//! This breaker is independent from the per-hook fault state kept by the
//! hook engine: hook failures never open it and it never gates hooks.

use crate::audit::{self, AuditSink, NullAuditSink};
use crate::config::BreakerConfig;
use crate::vm::panic_message;
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;

/// Errors returned by [`CircuitBreaker::safe_execute`]
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for plugin '{plugin}'")]
    Open { plugin: String },

    #[error("plugin call failed: {0}")]
    Failed(String),

    #[error("plugin call panicked: {0}")]
    Panicked(String),
}

impl BreakerError {
    /// Whether the call was rejected without running
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected
    Open,
    /// One probe call is let through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    probe_started: Option<Instant>,
}

/// Three-state failure breaker for one plugin
pub struct CircuitBreaker {
    plugin: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    audit: Arc<dyn AuditSink>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(plugin: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_audit(plugin, config, Arc::new(NullAuditSink))
    }

    /// Create a closed breaker that audits resets and trips
    pub fn with_audit(
        plugin: impl Into<String>,
        config: BreakerConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                probe_started: None,
            }),
            audit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugin this breaker guards
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Whether a call may proceed.
    ///
    /// An open circuit moves to half-open once the reset interval has passed
    /// since the last failure and lets exactly one probe through. A probe
    /// that never reports back is replaced after another reset interval.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .map_or(true, |at| now.duration_since(at) >= self.config.reset_interval);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_started = Some(now);
                    tracing::info!(plugin = %self.plugin, "Circuit half-open, probing");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                let stale = inner
                    .probe_started
                    .map_or(true, |at| now.duration_since(at) >= self.config.reset_interval);
                if stale {
                    inner.probe_started = Some(now);
                }
                stale
            }
        }
    }

    /// Close the circuit and zero the failure counter.
    ///
    /// Returns whether the circuit just opened, which a success never does.
    pub fn record_success(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(plugin = %self.plugin, "Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.probe_started = None;
        false
    }

    /// Count a failure. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let tripped = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.config.threshold,
            CircuitState::Open => false,
        };
        if !tripped {
            return false;
        }

        let reason = if inner.state == CircuitState::HalfOpen {
            "probe failed"
        } else {
            "failure threshold reached"
        };
        inner.state = CircuitState::Open;
        inner.probe_started = None;
        let failures = inner.failures;
        drop(inner);

        tracing::warn!(plugin = %self.plugin, failures, reason, "Circuit opened");
        audit::emit(
            self.audit.as_ref(),
            audit::breaker_tripped(&self.plugin, reason, failures),
        );
        true
    }

    /// Force the circuit closed on behalf of an administrator
    pub fn reset(&self, identity: &str) {
        let mut inner = self.lock();
        let failures = inner.failures;
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.probe_started = None;
        drop(inner);

        tracing::info!(plugin = %self.plugin, actor = %identity, "Circuit reset");
        audit::emit(
            self.audit.as_ref(),
            audit::breaker_reset(&self.plugin, identity, failures),
        );
    }

    /// Force the circuit open for an externally judged reason
    pub fn trip(&self, reason: &str) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.last_failure = Some(Instant::now());
        inner.probe_started = None;
        let failures = inner.failures;
        drop(inner);

        tracing::warn!(plugin = %self.plugin, reason = %reason, "Circuit tripped");
        audit::emit(
            self.audit.as_ref(),
            audit::breaker_tripped(&self.plugin, reason, failures),
        );
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures since the last success or reset
    pub fn consecutive_errors(&self) -> u32 {
        self.lock().failures
    }

    /// Run a unit of work behind the breaker.
    ///
    /// Rejects immediately when the circuit does not allow the call, turns a
    /// panic into [`BreakerError::Panicked`], and records the outcome.
    pub async fn safe_execute<F, T, E>(&self, work: F) -> Result<T, BreakerError>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.allow() {
            return Err(BreakerError::Open {
                plugin: self.plugin.clone(),
            });
        }

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(BreakerError::Failed(e.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(plugin = %self.plugin, panic = %message, "Recovered panic in plugin call");
                self.record_failure();
                Err(BreakerError::Panicked(message))
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("plugin", &self.plugin)
            .field("state", &inner.state)
            .field("failures", &inner.failures)
            .finish()
    }
}

/// Admin view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub plugin: String,
    pub state: CircuitState,
    pub consecutive_errors: u32,
}

/// One breaker per plugin, created on first use
pub struct BreakerRegistry {
    config: BreakerConfig,
    audit: Arc<dyn AuditSink>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            audit,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Breaker for a plugin
    pub fn get(&self, plugin: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
        {
            return breaker.clone();
        }

        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(plugin.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_audit(
                    plugin,
                    self.config.clone(),
                    self.audit.clone(),
                ))
            })
            .clone()
    }

    /// State of every breaker, ordered by plugin name
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|b| BreakerSnapshot {
                plugin: b.plugin().to_string(),
                state: b.state(),
                consecutive_errors: b.consecutive_errors(),
            })
            .collect()
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.snapshot())
            .finish()
    }
}
