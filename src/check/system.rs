use super::{Check, MB};
use crate::telemetry::{parse_kv_kb, read, Roots};
use anyhow::Result;
use serde_json::{json, Value};

/// This host's name, from the live `/proc`.
pub fn hostname() -> Option<String> {
    let name = std::fs::read_to_string("/proc/sys/kernel/hostname").ok()?;
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// `systemStats`: static host facts, reported once.
pub struct SystemStatsCheck {
    roots: Roots,
}

impl SystemStatsCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        read(&roots.proc("sys/kernel/osrelease"))?;
        Ok(Self {
            roots: roots.clone(),
        })
    }

    fn kernel_attr(&self, name: &str) -> Result<String> {
        Ok(read(&self.roots.proc(&format!("sys/kernel/{name}")))?
            .trim()
            .to_string())
    }
}

impl Check for SystemStatsCheck {
    fn key(&self) -> &str {
        "systemStats"
    }

    fn one_shot(&self) -> bool {
        true
    }

    fn run(&mut self) -> Result<Option<Value>> {
        let cpu_cores = read(&self.roots.proc("stat"))?
            .lines()
            .filter(|l| l.starts_with("cpu") && !l.starts_with("cpu "))
            .count();
        let mem_total = parse_kv_kb(&read(&self.roots.proc("meminfo"))?)
            .into_iter()
            .find(|(key, _)| key == "MemTotal")
            .map(|(_, bytes)| bytes)
            .unwrap_or(0);

        Ok(Some(json!({
            "hostname": self.kernel_attr("hostname")?,
            "kernel": self.kernel_attr("osrelease")?,
            "os": self.kernel_attr("ostype")?,
            "machine": std::env::consts::ARCH,
            "cpu_cores": cpu_cores,
            "mem_total_mb": mem_total / MB,
        })))
    }
}
