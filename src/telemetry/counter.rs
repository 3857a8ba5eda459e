//! Counter-sampled categories from /proc/diskstats, /proc/net/dev and /proc/stat.
//!
//! Raw kernel counters are cumulative. The source keeps the previous sample
//! per instance so every call can also report per-second rates and
//! utilization percentages over the interval since the last call.

use super::{read, Instance, Roots, TelemetrySource};
use crate::selector::TOTAL_INSTANCE;
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

type Counters = BTreeMap<&'static str, u64>;

/// Sector size /proc/diskstats counts in, independent of the device
const SECTOR_SIZE: u64 = 512;

const DISK_FIELDS: [&str; 11] = [
    "reads_completed",
    "reads_merged",
    "sectors_read",
    "read_time_ms",
    "writes_completed",
    "writes_merged",
    "sectors_written",
    "write_time_ms",
    "ios_in_progress",
    "io_time_ms",
    "weighted_io_time_ms",
];

const NET_FIELDS: [(&str, usize); 8] = [
    ("rx_bytes", 0),
    ("rx_packets", 1),
    ("rx_errors", 2),
    ("rx_drops", 3),
    ("tx_bytes", 8),
    ("tx_packets", 9),
    ("tx_errors", 10),
    ("tx_drops", 11),
];

const CPU_FIELDS: [&str; 8] = [
    "user", "nice", "system", "idle", "iowait", "irq", "softirq", "steal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Disk,
    Network,
    Processor,
}

impl Category {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "disk" => Some(Self::Disk),
            "network" => Some(Self::Network),
            "processor" => Some(Self::Processor),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Processor => "processor",
        }
    }
}

/// Rate-deriving source over one counter category.
pub struct CounterSource {
    roots: Roots,
    category: Category,
    prev: HashMap<String, Counters>,
    prev_at: Option<Instant>,
}

impl CounterSource {
    pub fn open(roots: Roots, category: &str) -> Result<Self> {
        let Some(category) = Category::parse(category) else {
            bail!("unknown counter category '{category}'");
        };
        Ok(Self {
            roots,
            category,
            prev: HashMap::new(),
            prev_at: None,
        })
    }

    /// Samples against an explicit clock reading.
    pub fn sample_at(&mut self, now: Instant) -> Result<Vec<Instance>> {
        let raw = self.read_raw()?;
        let secs = self
            .prev_at
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);

        let mut instances = Vec::with_capacity(raw.len());
        for (name, counters) in &raw {
            let prev = self.prev.get(name);
            let mut instance = Instance::new(name.clone());
            for (field, value) in counters {
                instance.set(field, *value);
            }
            for (field, value) in derive(self.category, counters, prev, secs) {
                instance.set(field, value);
            }
            instances.push(instance);
        }

        self.prev = raw.into_iter().collect();
        self.prev_at = Some(now);
        Ok(instances)
    }

    fn read_raw(&self) -> Result<Vec<(String, Counters)>> {
        match self.category {
            Category::Disk => Ok(parse_diskstats(&read(&self.roots.proc("diskstats"))?)),
            Category::Network => Ok(parse_net_dev(&read(&self.roots.proc("net/dev"))?)),
            Category::Processor => Ok(parse_stat(&read(&self.roots.proc("stat"))?)),
        }
    }
}

impl TelemetrySource for CounterSource {
    fn category(&self) -> &str {
        self.category.name()
    }

    fn sample(&mut self) -> Result<Vec<Instance>> {
        self.sample_at(Instant::now())
    }
}

/// Whole physical disks only: no partitions, loop, ram or device-mapper nodes.
pub fn is_whole_disk(device: &str) -> bool {
    if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
        return false;
    }
    let ends_with_digit = device.chars().last().is_some_and(|c| c.is_ascii_digit());
    if device.starts_with("nvme") || device.starts_with("mmcblk") {
        // nvme0n1 is a disk, nvme0n1p2 a partition
        !(device.contains('p') && ends_with_digit && device.rfind('p') > device.rfind('n'))
    } else {
        !ends_with_digit
    }
}

fn total_of<'a>(rows: impl Iterator<Item = &'a Counters>) -> Counters {
    let mut total = Counters::new();
    for row in rows {
        for (field, value) in row {
            *total.entry(*field).or_insert(0) += value;
        }
    }
    total
}

fn parse_diskstats(content: &str) -> Vec<(String, Counters)> {
    let mut rows = Vec::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }
        let counters: Counters = DISK_FIELDS
            .iter()
            .zip(&parts[3..14])
            .map(|(field, raw)| (*field, raw.parse().unwrap_or(0)))
            .collect();
        rows.push((parts[2].to_string(), counters));
    }

    let total = total_of(
        rows.iter()
            .filter(|(name, _)| is_whole_disk(name))
            .map(|(_, c)| c),
    );
    rows.push((TOTAL_INSTANCE.to_string(), total));
    rows
}

fn parse_net_dev(content: &str) -> Vec<(String, Counters)> {
    let mut rows = Vec::new();
    // First two lines are headers
    for line in content.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 16 {
            continue;
        }
        let counters: Counters = NET_FIELDS
            .iter()
            .map(|(field, idx)| (*field, parts[*idx].parse().unwrap_or(0)))
            .collect();
        rows.push((iface.trim().to_string(), counters));
    }

    let total = total_of(rows.iter().filter(|(name, _)| name != "lo").map(|(_, c)| c));
    rows.push((TOTAL_INSTANCE.to_string(), total));
    rows
}

fn parse_stat(content: &str) -> Vec<(String, Counters)> {
    let mut cores = Vec::new();
    let mut total = None;
    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else { continue };
        let values: Vec<u64> = parts.filter_map(|s| s.parse().ok()).collect();
        let counters: Counters = CPU_FIELDS
            .iter()
            .enumerate()
            .map(|(i, field)| (*field, values.get(i).copied().unwrap_or(0)))
            .collect();
        if label == "cpu" {
            total = Some(counters);
        } else {
            cores.push((label.to_string(), counters));
        }
    }
    if let Some(total) = total {
        cores.push((TOTAL_INSTANCE.to_string(), total));
    }
    cores
}

fn derive(
    category: Category,
    curr: &Counters,
    prev: Option<&Counters>,
    secs: f64,
) -> Vec<(&'static str, f64)> {
    let delta = |field: &str| -> f64 {
        let now = curr.get(field).copied().unwrap_or(0);
        prev.and_then(|p| p.get(field))
            .map(|before| now.saturating_sub(*before) as f64)
            .unwrap_or(0.0)
    };
    let per_sec = |value: f64| if secs > 0.0 { value / secs } else { 0.0 };

    match category {
        Category::Disk => {
            let reads = delta("reads_completed");
            let writes = delta("writes_completed");
            let elapsed_ms = secs * 1000.0;
            let transfers = reads + writes;
            vec![
                ("read_bytes_per_sec", per_sec(delta("sectors_read") * SECTOR_SIZE as f64)),
                ("write_bytes_per_sec", per_sec(delta("sectors_written") * SECTOR_SIZE as f64)),
                ("reads_per_sec", per_sec(reads)),
                ("writes_per_sec", per_sec(writes)),
                (
                    "utilization_percent",
                    if elapsed_ms > 0.0 {
                        (delta("io_time_ms") / elapsed_ms * 100.0).min(100.0)
                    } else {
                        0.0
                    },
                ),
                (
                    "avg_queue_size",
                    if elapsed_ms > 0.0 {
                        delta("weighted_io_time_ms") / elapsed_ms
                    } else {
                        0.0
                    },
                ),
                (
                    "avg_transfer_ms",
                    if transfers > 0.0 {
                        (delta("read_time_ms") + delta("write_time_ms")) / transfers
                    } else {
                        0.0
                    },
                ),
            ]
        }
        Category::Network => vec![
            ("rx_bytes_per_sec", per_sec(delta("rx_bytes"))),
            ("tx_bytes_per_sec", per_sec(delta("tx_bytes"))),
            ("rx_packets_per_sec", per_sec(delta("rx_packets"))),
            ("tx_packets_per_sec", per_sec(delta("tx_packets"))),
        ],
        Category::Processor => {
            let total: f64 = CPU_FIELDS.iter().map(|f| delta(*f)).sum();
            let pct = |v: f64| if total > 0.0 { 100.0 * v / total } else { 0.0 };
            let idle = delta("idle") + delta("iowait");
            vec![
                (
                    "processor_percent",
                    if total > 0.0 { 100.0 * (1.0 - idle / total) } else { 0.0 },
                ),
                ("user_percent", pct(delta("user") + delta("nice"))),
                ("system_percent", pct(delta("system") + delta("irq") + delta("softirq"))),
                ("iowait_percent", pct(delta("iowait"))),
                ("idle_percent", pct(delta("idle"))),
            ]
        }
    }
}
