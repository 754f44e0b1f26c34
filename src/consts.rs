pub const APP_NAME: &str = "readyflash";
pub const DEFAULT_CFG_PATH: &str = "/etc/readyflash.toml";
pub const LOCK_PATH: &str = "/run/readyflash.lock";
pub const LOG_FILE: &str = "readyflash.log";

/// Where install media shows up, in search order.
pub const SEARCH_PATHS: [&str; 8] = [
    "/cdrom/images",
    "/cdrom",
    "/run/archiso/bootmnt/images",
    "/run/archiso/bootmnt",
    "/mnt/cdrom/images",
    "/mnt/cdrom",
    "/media/cdrom/images",
    "/media/cdrom",
];
pub const MEDIA_MOUNT: &str = "/cdrom";
pub const IMAGE_EXTENSION: &str = "qcow2";
pub const IMAGE_FORMAT: &str = "qcow2";
pub const SEARCH_DEPTH: usize = 3;

/// Filesystems that can hold the root of a deployed image.
pub const ROOT_FSTYPES: [&str; 3] = ["ext4", "xfs", "btrfs"];
/// Files that must exist on a mounted partition before we treat it as `/`.
pub const ROOT_MARKERS: [&str; 2] = ["etc/passwd", "etc/os-release"];
pub const MOUNT_PREFIX: &str = "readyflash-target-";
