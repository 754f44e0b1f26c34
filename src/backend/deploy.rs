use std::path::Path;

use bytesize::ByteSize;
use serde::Deserialize;

use super::{CancelToken, Progress};
use crate::{
    cfg::Install,
    error::DeployError,
    install::InstallationPlan,
    stage,
    util::cmd::{Cmd, Host, HostExt},
};

const FLASH_START: f64 = 0.30;
const FLASH_END: f64 = 0.95;

/// The parts of `qemu-img info --output=json` we care about.
#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// Write the image of `plan` onto its device.
///
/// # Errors
/// - the image does not pass verification; the disk is left untouched
/// - cancelled before the write started
/// - another process holds the target device
/// - the write or the final flush failed
#[tracing::instrument(skip_all)]
pub fn deploy(
    host: &dyn Host,
    cfg: &Install,
    plan: &InstallationPlan,
    progress: &mut Progress<'_>,
    cancel: &CancelToken,
) -> Result<(), DeployError> {
    let dev = &plan.device.devpath;
    let image = plan.image.path();

    stage!(progress, 0.10, "Unmounting partitions…" {
        unmount_partitions(host, dev);
    });

    stage!(progress, 0.20, "Verifying image…" {
        verify_image(host, image, &cfg.image_format)?;
        if cancel.is_requested() {
            tracing::info!("Cancelled before writing to disk");
            return Err(DeployError::Cancelled);
        }
    });

    let _lock = stage!(progress, FLASH_START, "Flashing image to disk…" {
        let lock = host
            .lock_device(dev)
            .map_err(|source| DeployError::DeviceBusy { device: dev.clone(), source })?;
        cancel.begin_flash()?;
        tracing::warn!(dev = %dev.display(), "Overwriting disk");
        let cmd = Cmd::fatal("qemu-img")
            .args(["convert", "-p", "-f", cfg.image_format.as_str(), "-O", "raw"])
            .arg(image)
            .arg(dev)
            .timeout(cfg.flash_timeout());
        host.exec_streaming(&cmd, &mut |line| {
            if let Some(percent) = parse_convert_progress(line) {
                let fraction = (FLASH_END - FLASH_START).mul_add(percent / 100.0, FLASH_START);
                progress.report("Flashing image to disk…", fraction);
            }
        })
        .map_err(DeployError::Write)?;
        lock
    });

    stage!(progress, FLASH_END, "Syncing filesystem…" {
        host.exec(&Cmd::fatal("sync")).map_err(DeployError::Flush)?;
        _ = host.exec(&Cmd::best_effort("partprobe").arg(dev));
        host.sleep(cfg.settle());
    });

    Ok(())
}

/// Force-unmount every partition of `dev`. Nothing here is fatal.
fn unmount_partitions(host: &dyn Host, dev: &Path) {
    let Ok(out) = host.exec(&Cmd::best_effort("lsblk").arg("-lnpo").arg("NAME").arg(dev)) else {
        return;
    };
    for node in out.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
        if Path::new(node) == dev {
            continue;
        }
        tracing::debug!(node, "Unmounting");
        _ = host.exec(&Cmd::best_effort("umount").arg("-f").arg(node));
    }
}

fn verify_image(host: &dyn Host, image: &Path, format: &str) -> Result<(), DeployError> {
    let invalid = |reason: String| DeployError::InvalidImage {
        image: image.to_owned(),
        reason,
    };
    if !host.exists(image) {
        return Err(invalid("file does not exist".to_owned()));
    }
    let out = host
        .exec(&Cmd::fatal("qemu-img").args(["info", "--output=json"]).arg(image))
        .map_err(|e| invalid(e.to_string()))?;
    let info: ImageInfo = serde_json::from_str(&out.stdout)
        .map_err(|e| invalid(format!("cannot parse image info: {e}")))?;
    tracing::info!(format = %info.format, size = %ByteSize::b(info.virtual_size), "Image verified");
    if info.format != format {
        return Err(invalid(format!("expected {format} image, found {}", info.format)));
    }
    Ok(())
}

/// Percentage from a `qemu-img convert -p` line such as `    (42.17/100%)`.
#[must_use]
pub fn parse_convert_progress(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once('(')?;
    let (percent, _) = rest.split_once('/')?;
    percent.trim().parse().ok().filter(|p: &f64| (0.0..=100.0).contains(p))
}
