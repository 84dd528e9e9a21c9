//! Per-backend health tracking and restart gating.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Error log entries kept per backend.
pub const MAX_ERROR_LOG: usize = 10;

/// Failures at which a backend is DEGRADED.
const DEGRADED_AT: u32 = 2;

/// Failures at which a backend is FAILED.
const FAILED_AT: u32 = 5;

/// Health state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Healthy => "healthy",
            ServerState::Degraded => "degraded",
            ServerState::Failed => "failed",
            ServerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Aggregated reliability state of one backend.
///
/// Purely observational: nothing here restarts a process.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    /// Backend name.
    pub name: String,
    /// Current state.
    pub state: ServerState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Total successes.
    pub success_count: u64,
    /// Last successful send.
    pub last_success: Option<DateTime<Utc>>,
    /// Last failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// OS pid of the current process.
    pub process_id: Option<u32>,
    /// Most recent errors, oldest first.
    pub error_messages: VecDeque<String>,
}

impl ServerHealth {
    /// New record in STARTING.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ServerState::Starting,
            failure_count: 0,
            success_count: 0,
            last_success: None,
            last_failure: None,
            process_id: None,
            error_messages: VecDeque::new(),
        }
    }

    /// A new process was spawned. Counters survive restarts.
    pub fn mark_starting(&mut self, pid: Option<u32>) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.state = ServerState::Starting;
        self.process_id = pid;
    }

    /// Terminal state after explicit removal.
    pub fn mark_stopped(&mut self) {
        self.state = ServerState::Stopped;
        self.process_id = None;
    }

    /// Record a successful send.
    pub fn record_success(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        self.success_count += 1;
        self.failure_count = 0;
        self.last_success = Some(Utc::now());
        self.state = ServerState::Healthy;
    }

    /// Record a failure with a message for the error log.
    pub fn record_failure(&mut self, message: impl AsRef<str>) {
        if self.state == ServerState::Stopped {
            return;
        }
        let now = Utc::now();
        self.failure_count += 1;
        self.last_failure = Some(now);
        self.error_messages
            .push_back(format!("{}: {}", now.to_rfc3339(), message.as_ref()));
        while self.error_messages.len() > MAX_ERROR_LOG {
            self.error_messages.pop_front();
        }

        if self.failure_count >= FAILED_AT {
            self.state = ServerState::Failed;
        } else if self.failure_count >= DEGRADED_AT {
            self.state = ServerState::Degraded;
        }
    }

    /// Last `n` errors, oldest first.
    pub fn recent_errors(&self, n: usize) -> Vec<String> {
        let skip = self.error_messages.len().saturating_sub(n);
        self.error_messages.iter().skip(skip).cloned().collect()
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Gates restart attempts after repeated failures.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    recovery_timeout: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery_timeout,
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
            trial_in_flight: false,
        }
    }

    /// Whether a restart attempt may proceed. Moves OPEN to HALF_OPEN once
    /// the cooldown has elapsed; HALF_OPEN admits a single trial.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a success; closes the breaker.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.trial_in_flight = false;
    }

    /// Record a failure.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.trial_in_flight = false;
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Health of one backend in the system report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthReport {
    pub state: ServerState,
    pub circuit: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub process_id: Option<u32>,
    pub recent_errors: Vec<String>,
}

impl BackendHealthReport {
    /// Combine a health record with its breaker.
    pub fn new(health: &ServerHealth, breaker: &CircuitBreaker) -> Self {
        Self {
            state: health.state,
            circuit: breaker.state(),
            failure_count: health.failure_count,
            success_count: health.success_count,
            last_success: health.last_success,
            last_failure: health.last_failure,
            process_id: health.process_id,
            recent_errors: health.recent_errors(3),
        }
    }
}

/// Aggregate health of the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// `healthy` or `degraded`.
    pub overall_status: String,
    pub timestamp: DateTime<Utc>,
    pub servers: BTreeMap<String, BackendHealthReport>,
    pub failed_servers: Vec<String>,
    pub degraded_servers: Vec<String>,
    /// Orphans cleaned by the latest scan.
    pub orphaned_processes: usize,
    /// Orphans cleaned since boot.
    pub orphans_cleaned_total: u64,
}

impl SystemHealth {
    /// Build the report; any FAILED or DEGRADED backend degrades the whole.
    pub fn from_reports(
        servers: BTreeMap<String, BackendHealthReport>,
        orphaned_processes: usize,
        orphans_cleaned_total: u64,
    ) -> Self {
        let with_state = |state: ServerState| -> Vec<String> {
            servers
                .iter()
                .filter(|(_, r)| r.state == state)
                .map(|(name, _)| name.clone())
                .collect()
        };
        let failed_servers = with_state(ServerState::Failed);
        let degraded_servers = with_state(ServerState::Degraded);
        let overall_status = if failed_servers.is_empty() && degraded_servers.is_empty() {
            "healthy"
        } else {
            "degraded"
        };

        Self {
            overall_status: overall_status.into(),
            timestamp: Utc::now(),
            servers,
            failed_servers,
            degraded_servers,
            orphaned_processes,
            orphans_cleaned_total,
        }
    }

    /// Whether the overall status is healthy.
    pub fn is_healthy(&self) -> bool {
        self.overall_status == "healthy"
    }
}
