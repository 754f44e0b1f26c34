use std::path::{Path, PathBuf};

use super::Progress;
use crate::{
    cfg::{Install, RootPassword},
    consts::{MOUNT_PREFIX, ROOT_FSTYPES, ROOT_MARKERS},
    disks::{partition_path, BlockDevice},
    error::ConfigError,
    install::UserProfile,
    stage,
    util::cmd::{Cmd, Host, HostExt, Secret},
};

/// Everything mounted under the target root, in mount order.
///
/// Released through [`scopeguard`] so the target is unmounted on every exit path.
struct MountStack<'a> {
    host: &'a dyn Host,
    root: PathBuf,
    mounted: Vec<PathBuf>,
}

impl MountStack<'_> {
    fn release(self) {
        let _span = tracing::info_span!("teardown", root = %self.root.display()).entered();
        for target in self.mounted.iter().rev() {
            tracing::debug!(target = %target.display(), "Unmounting");
            _ = self.host.exec(&Cmd::best_effort("umount").arg("-f").arg(target));
        }
        _ = self.host.exec(&Cmd::best_effort("sync"));
        if let Err(e) = self.host.remove_dir(&self.root) {
            tracing::warn!(?e, "Cannot remove mount point");
        }
    }
}

fn hosts_file(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{hostname}\n\
         \n\
         ::1\t\tlocalhost ip6-localhost ip6-loopback\n\
         ff02::1\t\tip6-allnodes\n\
         ff02::2\t\tip6-allrouters\n"
    )
}

/// Partitions that may hold the deployed root filesystem, most likely first.
///
/// Every partition with a known root filesystem type in disk order, then the
/// configured fallback partition number.
fn root_candidates(host: &dyn Host, cfg: &Install, dev: &Path) -> Vec<PathBuf> {
    let out = host
        .exec(&Cmd::best_effort("lsblk").arg("-lnpo").arg("NAME,FSTYPE").arg(dev))
        .map(|out| out.stdout)
        .unwrap_or_default();
    let mut candidates: Vec<PathBuf> = (out.lines())
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let (name, fstype) = (cols.next()?, cols.next()?);
            ROOT_FSTYPES.contains(&fstype).then(|| PathBuf::from(name))
        })
        .collect();
    if candidates.is_empty() {
        tracing::warn!("No root filesystem detected, assuming fallback partition");
    }
    let fallback = partition_path(dev, cfg.fallback_root_partition);
    if !candidates.contains(&fallback) {
        candidates.push(fallback);
    }
    tracing::debug!(?candidates, "Root partition candidates");
    candidates
}

/// Mount each candidate on `stack.root` in turn and keep the first one that
/// holds an installed system. Rejected candidates are unmounted again.
fn mount_root(
    host: &dyn Host,
    stack: &mut MountStack<'_>,
    candidates: Vec<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    let root = stack.root.clone();
    let mut last_err = None;
    for part in candidates {
        if let Err(source) = host.exec(&Cmd::fatal("mount").arg(&part).arg(&root)) {
            last_err = Some(ConfigError::Mount { partition: part, source });
            continue;
        }
        if ROOT_MARKERS.iter().any(|m| host.exists(&root.join(m))) {
            stack.mounted.push(root);
            return Ok(part);
        }
        tracing::info!(part = %part.display(), "Not a root filesystem, trying next candidate");
        _ = host.exec(&Cmd::best_effort("umount").arg("-f").arg(&root));
        last_err = Some(ConfigError::NotARootFilesystem { partition: part });
    }
    Err(last_err.unwrap_or(ConfigError::NotARootFilesystem { partition: root }))
}

fn write(host: &dyn Host, path: PathBuf, contents: &str) -> Result<(), ConfigError> {
    tracing::debug!(path = %path.display(), "Writing");
    host.write_file(&path, contents)
        .map_err(|source| ConfigError::WriteFile { path, source })
}

/// Set up identity and accounts on the freshly written disk.
///
/// The target is always unmounted again, whether configuration succeeded or not.
/// Nothing that was written to the disk before is rolled back.
///
/// # Errors
/// Any fatal step; the error names the step.
#[tracing::instrument(skip_all, fields(device = %device.devpath.display()))]
pub fn configure(
    host: &dyn Host,
    cfg: &Install,
    device: &BlockDevice,
    profile: &UserProfile,
    progress: &mut Progress<'_>,
) -> Result<(), ConfigError> {
    let mut stack = stage!(progress, 0.96, "Configuring system…" {
        let root = host.scratch_dir(MOUNT_PREFIX).map_err(ConfigError::MountPoint)?;
        let candidates = root_candidates(host, cfg, &device.devpath);
        let mut stack = scopeguard::guard(
            MountStack { host, root: root.clone(), mounted: vec![] },
            MountStack::release,
        );
        let part = mount_root(host, &mut stack, candidates)?;
        tracing::info!(part = %part.display(), root = %root.display(), "Mounted target root");
        stack
    });
    let root = stack.root.clone();

    stage!(progress, 0.97, "Setting hostname…" {
        write(host, root.join("etc/hostname"), &format!("{}\n", profile.hostname()))?;
        write(host, root.join("etc/hosts"), &hosts_file(profile.hostname()))?;
    });

    for (target, cmd) in [
        ("proc", Cmd::best_effort("mount").args(["-t", "proc", "proc"])),
        ("sys", Cmd::best_effort("mount").args(["-t", "sysfs", "sys"])),
        ("dev", Cmd::best_effort("mount").args(["-o", "bind", "/dev"])),
        ("dev/pts", Cmd::best_effort("mount").args(["-t", "devpts", "devpts"])),
    ] {
        let target = root.join(target);
        if host.exec(&cmd.arg(&target)).is_ok_and(|out| out.success()) {
            stack.mounted.push(target);
        }
    }

    let user = profile.username();
    stage!(progress, 0.98, "Creating user account…" {
        let useradd = Cmd::fatal("useradd").args(["-m", "-s", cfg.shell.as_str(), user]);
        host.exec(&useradd.chrooted(&root))
            .map_err(|source| ConfigError::Account { action: "create user account", source })?;
        let chpasswd = Cmd::fatal("chpasswd")
            .stdin_secret(Secret::new(format!("{user}:{}\n", profile.password())));
        host.exec(&chpasswd.chrooted(&root))
            .map_err(|source| ConfigError::Account { action: "set user password", source })?;
        if !cfg.admin_group.is_empty() {
            let usermod = Cmd::best_effort("usermod").args(["-aG", cfg.admin_group.as_str(), user]);
            _ = host.exec(&usermod.chrooted(&root));
        }
    });

    stage!(progress, 0.99, "Securing root account…" {
        match cfg.root_password {
            RootPassword::SameAsUser => {
                tracing::warn!("Root account shares the new user's password");
                let chpasswd = Cmd::fatal("chpasswd")
                    .stdin_secret(Secret::new(format!("root:{}\n", profile.password())));
                host.exec(&chpasswd.chrooted(&root))
                    .map_err(|source| ConfigError::Account { action: "set root password", source })?;
            }
            RootPassword::Lock => {
                host.exec(&Cmd::fatal("passwd").args(["-l", "root"]).chrooted(&root))
                    .map_err(|source| ConfigError::Account { action: "lock root account", source })?;
            }
        }
    });

    drop(stack);
    Ok(())
}
