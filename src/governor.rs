//! Memory governor: evicts sessions and staged uploads under pressure.
//!
//! Every sample interval (15 s by default) the governor reads the process
//! resident set size and classifies it:
//!
//! | Level | Condition | Action |
//! |---|---|---|
//! | Normal | below `warn` | none |
//! | Warn | `warn` ≤ rss < `critical` | log, sweep expired sessions, release spare map capacity |
//! | Critical | rss ≥ `critical` | clear every session, purge staged uploads, then reclaim |
//!
//! Critical eviction is deliberately blunt: a request racing it simply sees
//! its session as not found. The last level and sample are kept for
//! `health()`.

use crate::session::SessionStore;
use crate::tasks::PeriodicTask;
use crate::uploads::{PurgeReport, UploadStaging};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_WARN_BYTES: u64 = 384 * 1024 * 1024;
pub const DEFAULT_CRITICAL_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressureLevel {
    Normal,
    Warn,
    Critical,
}

impl MemoryPressureLevel {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        match v {
            2 => MemoryPressureLevel::Critical,
            1 => MemoryPressureLevel::Warn,
            _ => MemoryPressureLevel::Normal,
        }
    }
}

/// Source of resident memory samples.
pub trait MemorySampler: Send + Sync {
    /// Resident set size in bytes, or `None` if the platform can't say.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Reports nothing on platforms
/// without procfs, which keeps the governor at Normal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSampler;

impl MemorySampler for ProcessSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// Extract `VmRSS` (reported in kB) from a `/proc/<pid>/status` dump.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub warn_bytes: u64,
    pub critical_bytes: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warn_bytes: DEFAULT_WARN_BYTES,
            critical_bytes: DEFAULT_CRITICAL_BYTES,
        }
    }
}

pub fn classify(resident: u64, thresholds: &Thresholds) -> MemoryPressureLevel {
    if resident >= thresholds.critical_bytes {
        MemoryPressureLevel::Critical
    } else if resident >= thresholds.warn_bytes {
        MemoryPressureLevel::Warn
    } else {
        MemoryPressureLevel::Normal
    }
}

/// What one governor pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GovernorReport {
    pub level: Option<MemoryPressureLevel>,
    pub resident_bytes: u64,
    /// Expired sessions removed by the reclaim pass.
    pub swept: usize,
    /// Live sessions dropped by a critical eviction.
    pub cleared: usize,
    pub purged: PurgeReport,
}

pub struct MemoryGovernor {
    sampler: Arc<dyn MemorySampler>,
    thresholds: Thresholds,
    sessions: Arc<SessionStore>,
    staging: Arc<UploadStaging>,
    level: AtomicU8,
    last_resident: AtomicU64,
}

impl MemoryGovernor {
    pub fn new(
        sampler: Arc<dyn MemorySampler>,
        thresholds: Thresholds,
        sessions: Arc<SessionStore>,
        staging: Arc<UploadStaging>,
    ) -> Self {
        Self {
            sampler,
            thresholds,
            sessions,
            staging,
            level: AtomicU8::new(MemoryPressureLevel::Normal.as_u8()),
            last_resident: AtomicU64::new(0),
        }
    }

    /// Last classified level.
    pub fn level(&self) -> MemoryPressureLevel {
        MemoryPressureLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Last sampled resident size in bytes (0 before the first sample).
    pub fn resident_bytes(&self) -> u64 {
        self.last_resident.load(Ordering::Relaxed)
    }

    /// Sample, classify, and act on the result.
    pub fn tick(&self) -> GovernorReport {
        let Some(resident) = self.sampler.resident_bytes() else {
            debug!("resident memory unavailable; skipping governor pass");
            return GovernorReport::default();
        };
        self.last_resident.store(resident, Ordering::Relaxed);

        let level = classify(resident, &self.thresholds);
        let previous = MemoryPressureLevel::from_u8(self.level.swap(level.as_u8(), Ordering::Relaxed));
        let resident_mb = resident / (1024 * 1024);

        let mut report = match level {
            MemoryPressureLevel::Normal => {
                if previous != MemoryPressureLevel::Normal {
                    info!(resident_mb, "memory pressure back to normal");
                }
                GovernorReport::default()
            }
            MemoryPressureLevel::Warn => {
                warn!(resident_mb, sessions = self.sessions.len(), "memory pressure elevated");
                self.reclaim()
            }
            MemoryPressureLevel::Critical => {
                warn!(resident_mb, sessions = self.sessions.len(), "memory pressure critical; evicting");
                self.evict_all()
            }
        };
        report.level = Some(level);
        report.resident_bytes = resident;
        report
    }

    /// Cooperative pass: drop expired sessions and give back spare capacity.
    pub fn reclaim(&self) -> GovernorReport {
        let swept = self.sessions.sweep();
        self.sessions.shrink();
        debug!(swept, "reclaim pass");
        GovernorReport {
            swept,
            ..GovernorReport::default()
        }
    }

    /// Clear every session and staged upload, then reclaim.
    pub fn evict_all(&self) -> GovernorReport {
        let cleared = self.sessions.clear();
        let purged = self.staging.purge_all();
        if purged.failed > 0 {
            warn!(failed = purged.failed, "some staged uploads could not be removed");
        }
        info!(cleared, purged = purged.removed, "critical eviction done");
        GovernorReport {
            cleared,
            purged,
            ..self.reclaim()
        }
    }

    /// Run [`tick`](Self::tick) every `interval` on the blocking pool until
    /// the task is stopped. Sampling reads procfs and eviction deletes files.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> PeriodicTask {
        PeriodicTask::spawn_blocking("memory-governor", interval, move || {
            self.tick();
        })
    }
}
