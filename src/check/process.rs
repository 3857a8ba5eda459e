use super::Check;
use crate::telemetry::{ObjectSource, Roots, TelemetrySource};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
struct ProcessCounts {
    total: u64,
    running: u64,
    sleeping: u64,
    blocked: u64,
    zombie: u64,
    threads: u64,
}

/// `processes`: process counts by scheduler state.
pub struct ProcessCountCheck {
    source: ObjectSource,
}

impl ProcessCountCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        Ok(Self {
            source: ObjectSource::open(roots.clone(), "process")?,
        })
    }
}

impl Check for ProcessCountCheck {
    fn key(&self) -> &str {
        "processes"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        let mut counts = ProcessCounts::default();
        for process in self.source.sample()? {
            counts.total += 1;
            counts.threads += process.f64("threads") as u64;
            match process.get("state").and_then(Value::as_str) {
                Some("R") => counts.running += 1,
                Some("S") | Some("I") => counts.sleeping += 1,
                Some("D") => counts.blocked += 1,
                Some("Z") => counts.zombie += 1,
                _ => {}
            }
        }
        Ok(Some(serde_json::to_value(counts)?))
    }
}
