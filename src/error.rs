use std::path::PathBuf;

use thiserror::Error;

use crate::util::cmd::CmdError;

/// A wizard step was not ready to be left.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no disk selected")]
    NoDiskSelected,
    #[error("please enter a username")]
    EmptyUsername,
    #[error("a username cannot start with '-' or contain ':', spaces or control characters")]
    InvalidUsername,
    #[error("please enter a computer name")]
    EmptyHostname,
    #[error("please enter a password")]
    EmptyPassword,
    #[error("a password cannot contain control characters")]
    InvalidPassword,
    #[error("passwords do not match")]
    PasswordMismatch,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("image {} failed verification: {reason}", image.display())]
    InvalidImage { image: PathBuf, reason: String },
    #[error("installation cancelled before the disk was written")]
    Cancelled,
    #[error("cannot take exclusive ownership of {}", device.display())]
    DeviceBusy {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write image to disk")]
    Write(#[source] CmdError),
    #[error("cannot flush written data to disk")]
    Flush(#[source] CmdError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot create mount point")]
    MountPoint(#[source] std::io::Error),
    #[error("cannot mount {}", partition.display())]
    Mount {
        partition: PathBuf,
        #[source]
        source: CmdError,
    },
    #[error("{} does not contain an installed system", partition.display())]
    NotARootFilesystem { partition: PathBuf },
    #[error("cannot write {}", path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot {action}")]
    Account {
        action: &'static str,
        #[source]
        source: CmdError,
    },
}

/// Why a background installation did not complete.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("image deployment failed")]
    Deploy(#[from] DeployError),
    #[error("system configuration failed")]
    Config(#[from] ConfigError),
    #[error("installation worker exited without reporting a result")]
    WorkerLost,
}

/// Requests the wizard refuses.
#[derive(Debug, Error)]
pub enum WizardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no installation image was found on the install media")]
    MediaNotFound,
    #[error("navigation is locked once installation has started")]
    NavigationLocked,
    #[error("an installation is in progress")]
    Busy,
    #[error("the disk is already being written, installation can no longer be cancelled")]
    CancelRejected,
    #[error("installation has not finished")]
    NotFinished,
    #[error("{} is not a known disk", .0.display())]
    UnknownDisk(PathBuf),
    #[error("cannot list disks")]
    Inventory(#[source] CmdError),
    #[error("cannot start installation worker")]
    Spawn(#[source] std::io::Error),
    #[error("cannot reboot")]
    Reboot(#[source] CmdError),
}
