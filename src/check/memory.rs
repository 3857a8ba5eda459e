//! Memory checks, one scalar in megabytes per key.

use super::{Check, MB};
use crate::telemetry::{Instance, ObjectSource, Roots, TelemetrySource};
use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStat {
    PhysFree,
    PhysUsed,
    Cached,
    SwapFree,
    SwapUsed,
}

impl MemoryStat {
    fn key(self) -> &'static str {
        match self {
            Self::PhysFree => "memPhysFree",
            Self::PhysUsed => "memPhysUsed",
            Self::Cached => "memCached",
            Self::SwapFree => "memSwapFree",
            Self::SwapUsed => "memSwapUsed",
        }
    }

    fn bytes(self, meminfo: &Instance) -> u64 {
        let get = |field: &str| meminfo.get(field).and_then(Value::as_u64).unwrap_or(0);
        match self {
            Self::PhysFree => meminfo
                .get("MemAvailable")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| get("MemFree")),
            // Used excludes buffers and page cache
            Self::PhysUsed => get("MemTotal")
                .saturating_sub(get("MemFree") + get("Buffers") + get("Cached")),
            Self::Cached => get("Cached"),
            Self::SwapFree => get("SwapFree"),
            Self::SwapUsed => get("SwapTotal").saturating_sub(get("SwapFree")),
        }
    }
}

/// Reads `/proc/meminfo` through the object source and reports one statistic.
pub struct MemoryCheck {
    source: ObjectSource,
    stat: MemoryStat,
}

impl MemoryCheck {
    pub fn new(roots: &Roots, stat: MemoryStat) -> Result<Self> {
        let mut source = ObjectSource::open(roots.clone(), "meminfo")?;
        source.sample()?;
        Ok(Self { source, stat })
    }
}

impl Check for MemoryCheck {
    fn key(&self) -> &str {
        self.stat.key()
    }

    fn run(&mut self) -> Result<Option<Value>> {
        let meminfo = self
            .source
            .sample()?
            .into_iter()
            .next()
            .context("meminfo reported no instance")?;
        Ok(Some(Value::from(self.stat.bytes(&meminfo) / MB)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::fixtures;

    #[test]
    fn reports_megabytes_per_statistic() {
        let (_dir, roots) = fixtures::host();
        let expected = [
            (MemoryStat::PhysFree, 4882),
            (MemoryStat::PhysUsed, 4785),
            (MemoryStat::Cached, 976),
            (MemoryStat::SwapFree, 1464),
            (MemoryStat::SwapUsed, 488),
        ];
        for (stat, mb) in expected {
            let mut check = MemoryCheck::new(&roots, stat).unwrap();
            assert_eq!(check.run().unwrap(), Some(Value::from(mb)), "{}", check.key());
        }
    }

    #[test]
    fn missing_meminfo_fails_construction() {
        let dir = tempfile::TempDir::new().unwrap();
        let roots = Roots::new(dir.path(), dir.path());
        assert!(MemoryCheck::new(&roots, MemoryStat::Cached).is_err());
    }
}
