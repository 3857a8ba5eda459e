//! Queryable object classes: point-in-time property bags from /proc and /sys.

use super::{parse_kv_kb, read, read_attr, Instance, Roots, TelemetrySource};
use crate::selector::TOTAL_INSTANCE;
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    MemInfo,
    LoadAvg,
    NetAdapter,
    BlockDevice,
    DefaultRoute,
    Process,
}

impl Class {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "meminfo" => Some(Self::MemInfo),
            "loadavg" => Some(Self::LoadAvg),
            "net_adapter" => Some(Self::NetAdapter),
            "block_device" => Some(Self::BlockDevice),
            "default_route" => Some(Self::DefaultRoute),
            "process" => Some(Self::Process),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::MemInfo => "meminfo",
            Self::LoadAvg => "loadavg",
            Self::NetAdapter => "net_adapter",
            Self::BlockDevice => "block_device",
            Self::DefaultRoute => "default_route",
            Self::Process => "process",
        }
    }
}

/// Source over one object class.
pub struct ObjectSource {
    roots: Roots,
    class: Class,
}

impl ObjectSource {
    pub fn open(roots: Roots, class: &str) -> Result<Self> {
        let Some(class) = Class::parse(class) else {
            bail!("unknown object class '{class}'");
        };
        Ok(Self { roots, class })
    }
}

impl TelemetrySource for ObjectSource {
    fn category(&self) -> &str {
        self.class.name()
    }

    fn sample(&mut self) -> Result<Vec<Instance>> {
        match self.class {
            Class::MemInfo => meminfo(&self.roots),
            Class::LoadAvg => loadavg(&self.roots),
            Class::NetAdapter => net_adapters(&self.roots),
            Class::BlockDevice => block_devices(&self.roots),
            Class::DefaultRoute => default_routes(&self.roots),
            Class::Process => processes(&self.roots),
        }
    }
}

/// Numeric attributes become numbers, everything else stays text.
fn attr_value(raw: String) -> Value {
    match raw.parse::<u64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::from(raw),
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

fn meminfo(roots: &Roots) -> Result<Vec<Instance>> {
    let content = read(&roots.proc("meminfo"))?;
    let mut instance = Instance::new(TOTAL_INSTANCE);
    for (key, bytes) in parse_kv_kb(&content) {
        instance.set(&key, bytes);
    }
    Ok(vec![instance])
}

fn loadavg(roots: &Roots) -> Result<Vec<Instance>> {
    let content = read(&roots.proc("loadavg"))?;
    let parts: Vec<&str> = content.split_whitespace().collect();
    let load = |i: usize| parts.get(i).and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
    let (running, total) = parts
        .get(3)
        .and_then(|s| s.split_once('/'))
        .map(|(r, t)| (r.parse::<u64>().unwrap_or(0), t.parse::<u64>().unwrap_or(0)))
        .unwrap_or((0, 0));

    Ok(vec![Instance::new(TOTAL_INSTANCE)
        .with("load1", load(0))
        .with("load5", load(1))
        .with("load15", load(2))
        .with("running", running)
        .with("total", total)])
}

fn net_adapters(roots: &Roots) -> Result<Vec<Instance>> {
    let base = roots.sys("class/net");
    let mut instances = Vec::new();
    for iface in sorted_entries(&base)? {
        let dir = base.join(&iface);
        let mut instance = Instance::new(iface.clone());
        for attr in ["mtu", "speed", "operstate", "address", "carrier"] {
            if let Some(raw) = read_attr(&dir.join(attr)) {
                instance.set(attr, attr_value(raw));
            }
        }
        let stats = dir.join("statistics");
        if let Ok(counters) = sorted_entries(&stats) {
            for counter in counters {
                if let Some(raw) = read_attr(&stats.join(&counter)) {
                    instance.set(&counter, attr_value(raw));
                }
            }
        }
        instances.push(instance);
    }
    Ok(instances)
}

fn block_devices(roots: &Roots) -> Result<Vec<Instance>> {
    let base = roots.sys("block");
    let mut instances = Vec::new();
    for dev in sorted_entries(&base)? {
        let dir = base.join(&dev);
        let number = |rel: &str| {
            read_attr(&dir.join(rel))
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0)
        };
        instances.push(
            Instance::new(dev.clone())
                .with("size_bytes", number("size") * 512)
                .with("removable", number("removable") == 1)
                .with("read_only", number("ro") == 1)
                .with("rotational", number("queue/rotational") == 1)
                .with("logical_block_size", number("queue/logical_block_size")),
        );
    }
    Ok(instances)
}

/// /proc/net/route stores addresses as little-endian hex.
fn decode_route_addr(hex: &str) -> String {
    match u32::from_str_radix(hex, 16) {
        Ok(raw) => {
            let [a, b, c, d] = raw.to_le_bytes();
            format!("{a}.{b}.{c}.{d}")
        }
        Err(_) => hex.to_string(),
    }
}

fn default_routes(roots: &Roots) -> Result<Vec<Instance>> {
    let content = read(&roots.proc("net/route"))?;
    let mut instances = Vec::new();
    for line in content.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 7 || cols[1] != "00000000" {
            continue;
        }
        instances.push(
            Instance::new(cols[0])
                .with("iface", cols[0])
                .with("gateway", decode_route_addr(cols[2]))
                .with("metric", cols[6].parse::<u64>().unwrap_or(0)),
        );
    }
    Ok(instances)
}

/// Parsed subset of /proc/<pid>/stat.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProcStat {
    pub comm: String,
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub threads: u64,
    pub vsize_bytes: u64,
    pub rss_pages: u64,
}

/// The comm field may contain spaces and parentheses, so split on the last ')'.
pub(crate) fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let comm_start = content.find('(')?;
    let comm_end = content.rfind(')')?;
    let comm = content.get(comm_start + 1..comm_end)?.to_string();
    let fields: Vec<&str> = content.get(comm_end + 2..)?.split_whitespace().collect();
    let num = |i: usize| fields.get(i).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

    Some(ProcStat {
        comm,
        state: fields.first().and_then(|s| s.chars().next()).unwrap_or('?'),
        utime: num(11),
        stime: num(12),
        threads: num(17),
        vsize_bytes: num(20),
        rss_pages: num(21),
    })
}

pub(crate) fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Numeric pid directories under the proc root, ascending.
pub(crate) fn list_pids(roots: &Roots) -> Result<Vec<u32>> {
    let mut pids: Vec<u32> = fs::read_dir(&roots.proc_root)
        .with_context(|| format!("Failed to list {}", roots.proc_root.display()))?
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

fn processes(roots: &Roots) -> Result<Vec<Instance>> {
    let page = page_size();
    let mut instances = Vec::new();
    for pid in list_pids(roots)? {
        // Processes may exit between listing and reading
        let Ok(content) = fs::read_to_string(roots.proc_root.join(pid.to_string()).join("stat"))
        else {
            continue;
        };
        let Some(stat) = parse_proc_stat(&content) else {
            continue;
        };
        instances.push(
            Instance::new(stat.comm.clone())
                .with("pid", pid)
                .with("comm", stat.comm)
                .with("state", stat.state.to_string())
                .with("threads", stat.threads)
                .with("rss_bytes", stat.rss_pages * page)
                .with("vsize_bytes", stat.vsize_bytes)
                .with("utime", stat.utime)
                .with("stime", stat.stime),
        );
    }
    Ok(instances)
}
