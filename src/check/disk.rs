//! Filesystem usage of mounted block devices.

use super::{round2, Check, MB};
use crate::telemetry::{read, Roots};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::path::{Path, PathBuf};
use tracing::debug;

const PSEUDO_FS: [&str; 4] = ["squashfs", "overlay", "tmpfs", "devtmpfs"];

#[derive(Debug, Clone, PartialEq)]
struct Mount {
    device: String,
    mount_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Usage {
    total: u64,
    used: u64,
    available: u64,
}

/// `diskUsage`: `[device, total_mb, used_mb, available_mb, used_percent, mount]` rows.
pub struct DiskUsageCheck {
    mounts_path: PathBuf,
}

impl DiskUsageCheck {
    pub fn new(roots: &Roots) -> Result<Self> {
        let mounts_path = roots.proc("mounts");
        read(&mounts_path)?;
        Ok(Self { mounts_path })
    }
}

impl Check for DiskUsageCheck {
    fn key(&self) -> &str {
        "diskUsage"
    }

    fn run(&mut self) -> Result<Option<Value>> {
        let rows: Vec<Value> = parse_mounts(&read(&self.mounts_path)?)
            .into_iter()
            .filter_map(|mount| {
                let usage = statvfs(Path::new(&mount.mount_point))?;
                let percent = if usage.total > 0 {
                    100.0 * usage.used as f64 / usage.total as f64
                } else {
                    0.0
                };
                Some(json!([
                    mount.device,
                    usage.total / MB,
                    usage.used / MB,
                    usage.available / MB,
                    round2(percent),
                    mount.mount_point,
                ]))
            })
            .collect();
        Ok(Some(Value::Array(rows)))
    }
}

/// Device-backed mounts, first mount per device only.
fn parse_mounts(content: &str) -> Vec<Mount> {
    let mut seen = HashSet::new();
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?.replace("\\040", " ");
            let fs_type = parts.next()?;
            if !device.starts_with("/dev/") || PSEUDO_FS.contains(&fs_type) {
                return None;
            }
            seen.insert(device.to_string()).then(|| Mount {
                device: device.to_string(),
                mount_point,
            })
        })
        .collect()
}

fn statvfs(path: &Path) -> Option<Usage> {
    let c_path = CString::new(path.to_string_lossy().as_bytes()).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        debug!(path = %path.display(), "statvfs failed");
        return None;
    }
    // SAFETY: statvfs returned 0, so the struct is initialised
    let stat = unsafe { stat.assume_init() };

    let block = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block;
    let free = stat.f_bfree as u64 * block;
    Some(Usage {
        total,
        used: total.saturating_sub(free),
        available: stat.f_bavail as u64 * block,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::fixtures;

    #[test]
    fn mounts_keep_first_real_device() {
        let mounts = parse_mounts(
            "/dev/sda1 / ext4 rw 0 0\n\
             proc /proc proc rw 0 0\n\
             /dev/sda1 /srv/bind ext4 rw 0 0\n\
             /dev/loop3 /snap/core squashfs ro 0 0\n\
             /dev/sdb1 /mnt/my\\040disk xfs rw 0 0\n",
        );
        let points: Vec<&str> = mounts.iter().map(|m| m.mount_point.as_str()).collect();
        assert_eq!(points, ["/", "/mnt/my disk"]);
    }

    #[test]
    fn reports_usage_rows_for_reachable_mounts() {
        let (dir, roots) = fixtures::host();
        let mount_point = dir.path().display().to_string();
        fixtures::write(
            &dir.path().join("proc"),
            "mounts",
            &format!("/dev/test {mount_point} ext4 rw 0 0\n/dev/gone /does/not/exist ext4 rw 0 0\n"),
        );

        let mut check = DiskUsageCheck::new(&roots).unwrap();
        let rows = check.run().unwrap().unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!("/dev/test"));
        assert_eq!(rows[0][5], json!(mount_point));
        assert_eq!(rows[0].as_array().unwrap().len(), 6);
    }
}
