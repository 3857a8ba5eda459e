//! Checks: units that produce one named result per tick.
//!
//! Built-in checks implement [`Check`] directly and run in the host. Plugin
//! checks never do; the host only knows them by key and reaches them through
//! the sandbox.

pub mod cpu;
pub mod disk;
pub mod io;
pub mod memory;
pub mod network;
pub mod process;
pub mod system;

use crate::telemetry::Roots;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Immediate snapshot per tick, or buffered out-of-band results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    #[default]
    Immediate,
    LongRunning,
}

/// Registration record for a plugin check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDescriptor {
    pub key: String,
    pub kind: CheckKind,
    /// Manifest file name the check was declared in
    pub module: String,
}

/// A synchronous check run once per tick.
pub trait Check: Send {
    /// Stable key used as the result's top-level name.
    fn key(&self) -> &str;

    /// Takes one snapshot. `Ok(None)` means nothing to report this tick.
    fn run(&mut self) -> Result<Option<Value>>;

    /// Removed from the active set after its first successful run.
    fn one_shot(&self) -> bool {
        false
    }
}

fn boxed<C: Check + 'static>(check: Result<C>) -> Result<Box<dyn Check>> {
    check.map(|c| Box::new(c) as Box<dyn Check>)
}

/// Constructs every built-in check. A check whose backing source is absent
/// on this host is logged once and left out of the active set.
pub fn builtin_checks(roots: &Roots) -> Vec<Box<dyn Check>> {
    use memory::{MemoryCheck, MemoryStat};

    let constructed = [
        ("ioStats", boxed(io::IoCheck::new(roots))),
        ("networkTraffic", boxed(network::NetworkTrafficCheck::new(roots))),
        ("cpuStats", boxed(cpu::CpuStatsCheck::new(roots))),
        ("loadAvrg", boxed(cpu::LoadAverageCheck::new(roots))),
        ("memPhysFree", boxed(MemoryCheck::new(roots, MemoryStat::PhysFree))),
        ("memPhysUsed", boxed(MemoryCheck::new(roots, MemoryStat::PhysUsed))),
        ("memCached", boxed(MemoryCheck::new(roots, MemoryStat::Cached))),
        ("memSwapFree", boxed(MemoryCheck::new(roots, MemoryStat::SwapFree))),
        ("memSwapUsed", boxed(MemoryCheck::new(roots, MemoryStat::SwapUsed))),
        ("diskUsage", boxed(disk::DiskUsageCheck::new(roots))),
        ("processes", boxed(process::ProcessCountCheck::new(roots))),
        ("systemStats", boxed(system::SystemStatsCheck::new(roots))),
    ];

    let mut checks = Vec::with_capacity(constructed.len());
    for (key, check) in constructed {
        match check {
            Ok(check) => checks.push(check),
            Err(e) => warn!(key, error = %format!("{e:#}"), "Built-in check unavailable"),
        }
    }
    info!(count = checks.len(), "Built-in checks ready");
    checks
}

/// Rounds to two decimals for readable payloads.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) const MB: u64 = 1024 * 1024;
