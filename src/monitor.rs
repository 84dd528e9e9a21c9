//! Process health monitoring and orphan cleanup.
//!
//! Two passes run on every tick: tracked backend pids are checked against the
//! OS process table, then untracked processes whose command line looks like
//! an MCP server and whose parent is gone are terminated.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributor::lock;
use crate::health::SystemHealth;
use crate::process::{kill_pid, terminate_pid};
use crate::registry::BackendRegistry;

/// Poll step while waiting for a terminated orphan to go away.
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Coarse OS scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    Zombie,
    Stopped,
    Dead,
    Other,
}

impl ProcessState {
    /// States in which a backend can never answer again.
    pub fn is_defunct(self) -> bool {
        matches!(self, Self::Zombie | Self::Stopped | Self::Dead)
    }
}

/// One row of the process table.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub parent: Option<u32>,
    pub command_line: String,
    pub state: ProcessState,
}

/// Read and signal OS processes.
pub trait ProcessTable: Send + Sync {
    /// Every visible process.
    fn snapshot(&self) -> Vec<ProcessSnapshot>;

    /// State of one pid, `None` if it no longer exists.
    fn status(&self, pid: u32) -> Option<ProcessState>;

    /// Ask a process to exit.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Force a process to exit.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessTable`] backed by sysinfo.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

fn map_status(status: ProcessStatus) -> ProcessState {
    match status {
        ProcessStatus::Run => ProcessState::Running,
        ProcessStatus::Sleep | ProcessStatus::Idle => ProcessState::Sleeping,
        ProcessStatus::Zombie => ProcessState::Zombie,
        ProcessStatus::Stop | ProcessStatus::Tracing => ProcessState::Stopped,
        ProcessStatus::Dead => ProcessState::Dead,
        _ => ProcessState::Other,
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let mut system = lock(&self.system);
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessSnapshot {
                pid: pid.as_u32(),
                parent: process.parent().map(|p| p.as_u32()),
                command_line: process
                    .cmd()
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                state: map_status(process.status()),
            })
            .collect()
    }

    fn status(&self, pid: u32) -> Option<ProcessState> {
        let mut system = lock(&self.system);
        let pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| map_status(p.status()))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        terminate_pid(pid)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        kill_pid(pid)
    }
}

/// Periodic backend liveness checks and orphan reaping.
pub struct ProcessMonitor {
    registry: Arc<BackendRegistry>,
    table: Arc<dyn ProcessTable>,
    patterns: Vec<String>,
    interval: Duration,
    stop_timeout: Duration,
    last_orphans: AtomicUsize,
    orphans_total: AtomicU64,
}

impl ProcessMonitor {
    pub fn new(registry: Arc<BackendRegistry>, table: Arc<dyn ProcessTable>) -> Self {
        let config = registry.config();
        let patterns = config
            .orphan_patterns
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        let interval = config.monitor_interval;
        let stop_timeout = config.stop_timeout;
        Self {
            registry,
            table,
            patterns,
            interval,
            stop_timeout,
            last_orphans: AtomicUsize::new(0),
            orphans_total: AtomicU64::new(0),
        }
    }

    /// Mark every tracked backend whose process is zombie, stopped or gone
    /// as dead. Returns the affected backend names.
    pub async fn check_backends(&self) -> Vec<String> {
        let mut dead = Vec::new();
        for (name, pid) in self.registry.tracked_pids().await {
            let reason = match self.table.status(pid) {
                Some(state) if state.is_defunct() => format!("process {pid} is {state:?}"),
                Some(_) => continue,
                None => format!("process {pid} disappeared"),
            };
            match self.registry.mark_dead(&name, &reason).await {
                Ok(()) => dead.push(name),
                Err(e) => debug!(backend = %name, error = %e, "backend vanished before cleanup"),
            }
        }
        dead
    }

    /// Terminate untracked MCP-server processes whose parent is gone.
    /// Returns how many were cleaned.
    pub async fn scan_orphans(&self) -> usize {
        let mut patterns = self.patterns.clone();
        patterns.extend(
            self.registry
                .launch_patterns()
                .await
                .into_iter()
                .map(|p| p.to_lowercase()),
        );
        let tracked: HashSet<u32> = self
            .registry
            .tracked_pids()
            .await
            .into_iter()
            .map(|(_, pid)| pid)
            .collect();

        let snapshot = self.table.snapshot();
        let live: HashSet<u32> = snapshot.iter().map(|p| p.pid).collect();
        let own_pid = std::process::id();

        let orphans: Vec<&ProcessSnapshot> = snapshot
            .iter()
            .filter(|p| p.pid != own_pid && !tracked.contains(&p.pid))
            .filter(|p| !p.state.is_defunct())
            .filter(|p| p.parent.is_some_and(|parent| !live.contains(&parent)))
            .filter(|p| {
                let command = p.command_line.to_lowercase();
                !command.is_empty() && patterns.iter().any(|pattern| command.contains(pattern.as_str()))
            })
            .collect();

        let mut cleaned = 0;
        for orphan in orphans {
            match self.reap(orphan.pid).await {
                Ok(()) => {
                    info!(pid = orphan.pid, command = %orphan.command_line, "orphaned process cleaned");
                    cleaned += 1;
                }
                Err(e) => warn!(pid = orphan.pid, error = %e, "failed to clean orphaned process"),
            }
        }

        self.last_orphans.store(cleaned, Ordering::Relaxed);
        self.orphans_total.fetch_add(cleaned as u64, Ordering::Relaxed);
        cleaned
    }

    async fn reap(&self, pid: u32) -> io::Result<()> {
        self.table.terminate(pid)?;
        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            match self.table.status(pid) {
                None => return Ok(()),
                Some(state) if state.is_defunct() => return Ok(()),
                Some(_) => tokio::time::sleep(ORPHAN_POLL_INTERVAL).await,
            }
        }
        debug!(pid, "orphan ignored SIGTERM, killing");
        self.table.kill(pid)
    }

    /// One monitor tick.
    pub async fn tick(&self) {
        let dead = self.check_backends().await;
        if !dead.is_empty() {
            warn!(?dead, "dead backends detected");
        }
        let cleaned = self.scan_orphans().await;
        debug!(cleaned, "monitor tick finished");
    }

    /// Tick every interval until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.recv() => break,
                }
            }
            debug!("process monitor stopped");
        })
    }

    /// Aggregate health report.
    pub async fn system_health(&self) -> SystemHealth {
        SystemHealth::from_reports(
            self.registry.health_reports().await,
            self.last_orphans.load(Ordering::Relaxed),
            self.orphans_total.load(Ordering::Relaxed),
        )
    }
}
