//! Admission control
//!
//! Two bounded counters in front of the fallback chain: one global, one per
//! session. `admit` checks global capacity, then session capacity, and either
//! hands out a [`QueueTicket`] or rejects with a retry hint. Nothing queues;
//! excess load is shed immediately.
//!
//! A ticket holds one slot in both counters until it is released, explicitly
//! or by being dropped. Release is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::AdmissionConfig;
use crate::telemetry::{SharedMetrics, ADMISSION_ACCEPTED, ADMISSION_REJECTED};

/// Which counter turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionScope {
    Global,
    Session,
}

impl AdmissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for AdmissionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{scope} capacity exhausted, retry after {retry_after:?}")]
pub struct Rejected {
    pub scope: AdmissionScope,
    pub retry_after: Duration,
}

impl Rejected {
    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after.as_millis() as u64
    }
}

/// Admission counters and totals, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionSnapshot {
    pub global_in_flight: usize,
    pub global_max: usize,
    pub session_max: usize,
    /// `global_in_flight / global_max`
    pub utilization: f64,
    pub tracked_sessions: usize,
    pub total_admitted: u64,
    pub rejected_global: u64,
    pub rejected_session: u64,
    /// Rejections over all admission attempts.
    pub rejection_rate: f64,
}

#[derive(Debug)]
struct AdmissionState {
    limits: AdmissionConfig,
    global: usize,
    /// Only sessions with at least one ticket out are present.
    sessions: HashMap<String, usize>,
    total_admitted: u64,
    rejected_global: u64,
    rejected_session: u64,
}

impl AdmissionState {
    fn release(&mut self, session_id: &str) {
        self.global = self.global.saturating_sub(1);
        if let Some(count) = self.sessions.get_mut(session_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.sessions.remove(session_id);
            }
        }
    }
}

struct Shared {
    state: Mutex<AdmissionState>,
    metrics: SharedMetrics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Global + per-session load shedder.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("state", &*self.shared.lock())
            .finish()
    }
}

impl AdmissionController {
    pub fn new(limits: AdmissionConfig, metrics: SharedMetrics) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AdmissionState {
                    limits,
                    global: 0,
                    sessions: HashMap::new(),
                    total_admitted: 0,
                    rejected_global: 0,
                    rejected_session: 0,
                }),
                metrics,
            }),
        }
    }

    /// Take a slot in both counters or reject.
    pub fn admit(&self, session_id: &str) -> Result<QueueTicket, Rejected> {
        let decision = {
            let mut state = self.shared.lock();
            let session_count = state.sessions.get(session_id).copied().unwrap_or(0);
            if state.global >= state.limits.global_max {
                state.rejected_global += 1;
                Err(Rejected {
                    scope: AdmissionScope::Global,
                    retry_after: Duration::from_millis(state.limits.global_backoff_ms),
                })
            } else if session_count >= state.limits.session_max {
                state.rejected_session += 1;
                Err(Rejected {
                    scope: AdmissionScope::Session,
                    retry_after: Duration::from_millis(state.limits.session_backoff_ms),
                })
            } else {
                state.global += 1;
                *state.sessions.entry(session_id.to_string()).or_insert(0) += 1;
                state.total_admitted += 1;
                Ok(())
            }
        };

        match decision {
            Ok(()) => {
                self.shared.metrics.record_counter(ADMISSION_ACCEPTED, 1, &[]);
                Ok(QueueTicket {
                    id: Uuid::new_v4(),
                    session_id: session_id.to_string(),
                    admitted_at: Utc::now(),
                    cancel: CancellationToken::new(),
                    released: AtomicBool::new(false),
                    shared: Arc::clone(&self.shared),
                })
            }
            Err(rejected) => {
                self.shared.metrics.record_counter(
                    ADMISSION_REJECTED,
                    1,
                    &[("scope", rejected.scope.as_str())],
                );
                debug!(
                    session = %session_id,
                    scope = %rejected.scope,
                    retry_after_ms = rejected.retry_after_ms(),
                    "Admission rejected"
                );
                Err(rejected)
            }
        }
    }

    /// Apply new limits. Tickets already issued stay valid even if the new
    /// caps are below the current counts.
    pub fn reconfigure(&self, limits: AdmissionConfig) {
        self.shared.lock().limits = limits;
    }

    pub fn global_in_flight(&self) -> usize {
        self.shared.lock().global
    }

    pub fn session_in_flight(&self, session_id: &str) -> usize {
        self.shared
            .lock()
            .sessions
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.shared.lock();
        let rejected = state.rejected_global + state.rejected_session;
        let attempts = state.total_admitted + rejected;
        AdmissionSnapshot {
            global_in_flight: state.global,
            global_max: state.limits.global_max,
            session_max: state.limits.session_max,
            utilization: if state.limits.global_max > 0 {
                state.global as f64 / state.limits.global_max as f64
            } else {
                0.0
            },
            tracked_sessions: state.sessions.len(),
            total_admitted: state.total_admitted,
            rejected_global: state.rejected_global,
            rejected_session: state.rejected_session,
            rejection_rate: if attempts > 0 {
                rejected as f64 / attempts as f64
            } else {
                0.0
            },
        }
    }
}

/// An admitted request's hold on the admission counters.
pub struct QueueTicket {
    id: Uuid,
    session_id: String,
    admitted_at: DateTime<Utc>,
    cancel: CancellationToken,
    released: AtomicBool,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl QueueTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    /// Token observed by the chain and, through child tokens, the analyzers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give both counter slots back. Returns `false` if already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.lock().release(&self.session_id);
        true
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.release();
    }
}
