//! CPU utilisation and load average.

use super::{round2, Check};
use crate::telemetry::{CounterSource, ObjectSource, Roots, TelemetrySource};
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::time::Instant;

/// `cpuStats`: utilisation percentages for `_Total` and each core.
pub struct CpuStatsCheck {
    source: CounterSource,
}

impl CpuStatsCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        let mut source = CounterSource::open(roots.clone(), "processor")?;
        source.sample()?;
        Ok(Self { source })
    }

    fn collect_at(&mut self, now: Instant) -> Result<Value> {
        let mut results = Map::new();
        for cpu in self.source.sample_at(now)? {
            results.insert(
                cpu.name.clone(),
                json!({
                    "user": round2(cpu.f64("user_percent")),
                    "system": round2(cpu.f64("system_percent")),
                    "iowait": round2(cpu.f64("iowait_percent")),
                    "idle": round2(cpu.f64("idle_percent")),
                    "usage": round2(cpu.f64("processor_percent")),
                }),
            );
        }
        Ok(Value::Object(results))
    }
}

impl Check for CpuStatsCheck {
    fn key(&self) -> &str {
        "cpuStats"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        self.collect_at(Instant::now()).map(Some)
    }
}

/// `loadAvrg`: the one-minute load average.
pub struct LoadAverageCheck {
    source: ObjectSource,
}

impl LoadAverageCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        let mut source = ObjectSource::open(roots.clone(), "loadavg")?;
        source.sample()?;
        Ok(Self { source })
    }
}

impl Check for LoadAverageCheck {
    fn key(&self) -> &str {
        "loadAvrg"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        let load = self
            .source
            .sample()?
            .into_iter()
            .next()
            .context("loadavg reported no instance")?;
        Ok(Some(Value::from(load.f64("load1"))))
    }
}
