use super::{round2, Check};
use crate::selector::TOTAL_INSTANCE;
use crate::telemetry::{CounterSource, Roots, TelemetrySource};
use anyhow::Result;
use serde_json::{json, Map, Value};
use std::time::Instant;

/// `networkTraffic`: bytes per second received and transmitted per interface.
pub struct NetworkTrafficCheck {
    source: CounterSource,
}

impl NetworkTrafficCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        let mut source = CounterSource::open(roots.clone(), "network")?;
        source.sample()?;
        Ok(Self { source })
    }

    fn collect_at(&mut self, now: Instant) -> Result<Value> {
        let mut results = Map::new();
        for iface in self.source.sample_at(now)? {
            if iface.name == "lo" || iface.name == TOTAL_INSTANCE {
                continue;
            }
            results.insert(
                iface.name.clone(),
                json!({
                    "recv_bytes": round2(iface.f64("rx_bytes_per_sec")),
                    "trans_bytes": round2(iface.f64("tx_bytes_per_sec")),
                }),
            );
        }
        Ok(Value::Object(results))
    }
}

impl Check for NetworkTrafficCheck {
    fn key(&self) -> &str {
        "networkTraffic"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        self.collect_at(Instant::now()).map(Some)
    }
}
