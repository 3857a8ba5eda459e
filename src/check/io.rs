//! Per-drive I/O statistics in iostat terms.

use super::{round2, Check};
use crate::telemetry::counter::is_whole_disk;
use crate::telemetry::{CounterSource, Instance, Roots, TelemetrySource};
use anyhow::{bail, Result};
use serde_json::{Map, Value};
use std::time::Instant;

/// One reported sub-metric of a drive.
#[derive(Debug, Clone, PartialEq)]
struct DriveMetric {
    name: &'static str,
    counter: &'static str,
    divisor: f64,
}

const DRIVE_METRICS: [DriveMetric; 7] = [
    DriveMetric { name: "rkB/s", counter: "read_bytes_per_sec", divisor: 1024.0 },
    DriveMetric { name: "wkB/s", counter: "write_bytes_per_sec", divisor: 1024.0 },
    DriveMetric { name: "%util", counter: "utilization_percent", divisor: 1.0 },
    DriveMetric { name: "avgqu-sz", counter: "avg_queue_size", divisor: 1.0 },
    DriveMetric { name: "r/s", counter: "reads_per_sec", divisor: 1.0 },
    DriveMetric { name: "w/s", counter: "writes_per_sec", divisor: 1.0 },
    DriveMetric { name: "svctm", counter: "avg_transfer_ms", divisor: 1.0 },
];

/// A physical drive to report on.
#[derive(Debug, Clone, PartialEq)]
struct Drive {
    /// Name in the payload
    name: String,
    /// Counter instance the metrics are read from
    instance: String,
    metrics: Vec<DriveMetric>,
}

impl Drive {
    fn report(&self, instance: &Instance) -> Map<String, Value> {
        let mut out = Map::new();
        for metric in &self.metrics {
            out.insert(
                metric.name.to_string(),
                Value::from(round2(instance.f64(metric.counter) / metric.divisor)),
            );
        }

        let reads = instance.f64("reads_per_sec");
        let total = reads + instance.f64("writes_per_sec");
        let ratio = if total > 0.0 { reads / total * 100.0 } else { 0.0 };
        out.insert("rwratio".to_string(), Value::from(round2(ratio)));
        out
    }
}

/// `ioStats`: one entry per whole disk.
pub struct IoCheck {
    source: CounterSource,
    drives: Vec<Drive>,
}

impl IoCheck {
    /// Discovers drives and takes the priming sample so the first tick has rates.
    pub fn new(roots: &Roots) -> Result<Self> {
        let mut source = CounterSource::open(roots.clone(), "disk")?;
        let drives: Vec<Drive> = source
            .sample()?
            .into_iter()
            .filter(|i| is_whole_disk(&i.name) && !i.name.starts_with('_'))
            .map(|i| Drive {
                name: i.name.clone(),
                instance: i.name,
                metrics: DRIVE_METRICS.to_vec(),
            })
            .collect();

        if drives.is_empty() {
            bail!("no physical disks in {}", roots.proc("diskstats").display());
        }
        Ok(Self { source, drives })
    }

    fn collect_at(&mut self, now: Instant) -> Result<Value> {
        let instances = self.source.sample_at(now)?;
        let mut results = Map::new();
        for drive in &self.drives {
            // A drive that disappeared since construction is simply not reported
            if let Some(instance) = instances.iter().find(|i| i.name == drive.instance) {
                results.insert(drive.name.clone(), Value::Object(drive.report(instance)));
            }
        }
        Ok(Value::Object(results))
    }
}

impl Check for IoCheck {
    fn key(&self) -> &str {
        "ioStats"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        self.collect_at(Instant::now()).map(Some)
    }
}
