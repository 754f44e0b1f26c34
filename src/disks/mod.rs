use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::util::cmd::{Cmd, CmdError, Host, HostExt};

/// A whole disk that can be installed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub devpath: PathBuf,
    /// Human-readable, as printed by `lsblk`.
    pub size: String,
    pub model: String,
}

impl std::fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.devpath.display(), self.size, self.model)
    }
}

/// Scan the system for disks eligible as install targets.
///
/// # Errors
/// `lsblk` cannot be run or fails.
#[tracing::instrument(skip_all)]
pub fn refresh(host: &dyn Host) -> Result<Vec<BlockDevice>, CmdError> {
    let out = host.exec(&Cmd::fatal("lsblk").arg("-dpno").arg("NAME,SIZE,MODEL"))?;
    let disks = parse_lsblk(&out.stdout);
    tracing::info!(count = disks.len(), ?disks, "Found disks");
    Ok(disks)
}

fn is_excluded(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    name.contains("loop")
        || base
            .strip_prefix("sr")
            .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

/// Parse `lsblk -dpno NAME,SIZE,MODEL`.
///
/// Loop and optical devices are dropped, as are lines without a size.
#[must_use]
pub fn parse_lsblk(out: &str) -> Vec<BlockDevice> {
    out.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let size = cols.next()?;
            if is_excluded(name) {
                tracing::trace!(name, "Skipping non-installable device");
                return None;
            }
            let model = cols.collect::<Vec<_>>().join(" ");
            Some(BlockDevice {
                devpath: name.into(),
                size: size.to_owned(),
                model: if model.is_empty() {
                    "Unknown".to_owned()
                } else {
                    model
                },
            })
        })
        .collect()
}

/// Path of partition `n` on `dev`.
///
/// Devices whose names end in a digit (`nvme0n1`, `mmcblk0`, `loop0`) separate
/// the partition number with a `p`.
#[must_use]
pub fn partition_path(dev: &Path, n: u32) -> PathBuf {
    let name = dev.to_string_lossy();
    let sep = if name.contains("nvme")
        || name.contains("mmcblk")
        || name.ends_with(|c: char| c.is_ascii_digit())
    {
        "p"
    } else {
        ""
    };
    PathBuf::from(format!("{name}{sep}{n}"))
}
