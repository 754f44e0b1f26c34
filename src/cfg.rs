#![allow(clippy::str_to_string)]
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Deserialize;
use serde_valid::toml::FromTomlStr;
use serde_valid::Validate;

use crate::consts::{
    DEFAULT_CFG_PATH, IMAGE_EXTENSION, IMAGE_FORMAT, MEDIA_MOUNT, SEARCH_DEPTH, SEARCH_PATHS,
};

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Media {
    /// Searched in order, first image wins.
    #[validate(min_items = 1)]
    pub search_paths: Vec<std::path::PathBuf>,
    #[validate(min_length = 1)]
    pub extension: String,
    #[validate(minimum = 1)]
    #[validate(maximum = 8)]
    pub max_depth: usize,
    /// Mount point of the install media, waited for before searching.
    pub wait_path: std::path::PathBuf,
    /// How long to wait for `wait_path` to show up.
    pub wait_secs: u64,
}

impl Default for Media {
    fn default() -> Self {
        Self {
            search_paths: SEARCH_PATHS.iter().map(Into::into).collect(),
            extension: IMAGE_EXTENSION.to_owned(),
            max_depth: SEARCH_DEPTH,
            wait_path: MEDIA_MOUNT.into(),
            wait_secs: 30,
        }
    }
}

/// What happens to the root account of the installed system.
#[derive(Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RootPassword {
    /// Root gets the same password as the new user.
    #[default]
    SameAsUser,
    /// Root login by password is disabled.
    Lock,
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Install {
    #[validate(min_length = 1)]
    pub image_format: String,
    pub admin_group: String,
    #[validate(min_length = 1)]
    pub shell: String,
    pub root_password: RootPassword,
    /// Partition number assumed to hold the root filesystem when none is detected.
    #[validate(minimum = 1)]
    pub fallback_root_partition: u32,
    pub settle_secs: u64,
    #[validate(minimum = 1)]
    pub command_timeout_secs: u64,
    #[validate(minimum = 1)]
    pub flash_timeout_secs: u64,
    pub log_dir: std::path::PathBuf,
}

impl Default for Install {
    fn default() -> Self {
        Self {
            image_format: IMAGE_FORMAT.to_owned(),
            admin_group: "sudo".to_owned(),
            shell: "/bin/bash".to_owned(),
            root_password: RootPassword::default(),
            fallback_root_partition: 2,
            settle_secs: 2,
            command_timeout_secs: 300,
            flash_timeout_secs: 4 * 60 * 60,
            log_dir: "/var/log/readyflash".into(),
        }
    }
}

impl Install {
    #[must_use]
    pub const fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub const fn flash_timeout(&self) -> Duration {
        Duration::from_secs(self.flash_timeout_secs)
    }
}

#[derive(Deserialize, Validate, Default, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReadyflashConfig {
    #[validate]
    pub media: Media,
    #[validate]
    pub install: Install,
}

/// # Errors
/// - cannot read config file
/// - config file is invalid
#[allow(clippy::module_name_repetitions)]
#[tracing::instrument]
pub fn get_cfg() -> Result<ReadyflashConfig> {
    let path = std::env::var("READYFLASH_CONFIG");
    match &path {
        Err(std::env::VarError::NotUnicode(s)) => {
            tracing::error!(?s, "Cannot parse READYFLASH_CONFIG due to invalid unicode");
            tracing::debug!("Falling back to {DEFAULT_CFG_PATH}");
        }
        Ok(p) => tracing::debug!("Using READYFLASH_CONFIG={p}"),
        Err(std::env::VarError::NotPresent) => tracing::trace!("Using {DEFAULT_CFG_PATH}"),
    }
    let explicit = path.is_ok();
    let path = path.as_deref().unwrap_or(DEFAULT_CFG_PATH);
    let toml = match std::fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::info!("No config file at {path}, using defaults");
            return Ok(ReadyflashConfig::default());
        }
        r => r.map_err(|e| eyre!("Cannot read config file at {path:?}").wrap_err(e))?,
    };
    Ok(ReadyflashConfig::from_toml_str(&toml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg() {
        assert_eq!(
            ReadyflashConfig::from_toml_str(
                r#"
                [media]
                search_paths = ["/run/media/images"]
                extension = "img"

                [install]
                image_format = "raw"
                root_password = "lock"
                admin_group = "wheel"
                "#
            )
            .unwrap(),
            ReadyflashConfig {
                media: Media {
                    search_paths: vec!["/run/media/images".into()],
                    extension: "img".into(),
                    ..Media::default()
                },
                install: Install {
                    image_format: "raw".into(),
                    root_password: RootPassword::Lock,
                    admin_group: "wheel".into(),
                    ..Install::default()
                },
            },
        );
    }

    #[test]
    fn test_cfg_defaults() {
        let cfg = ReadyflashConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ReadyflashConfig::default());
        assert_eq!(cfg.media.search_paths.len(), 8);
        assert_eq!(cfg.media.search_paths[0], std::path::Path::new("/cdrom/images"));
        assert_eq!(cfg.install.root_password, RootPassword::SameAsUser);
        assert_eq!(cfg.install.settle(), Duration::from_secs(2));
    }

    #[test]
    fn test_cfg_rejects_invalid() {
        assert!(ReadyflashConfig::from_toml_str("[media]\nsearch_paths = []\n").is_err());
        assert!(ReadyflashConfig::from_toml_str("[media]\nmax_depth = 0\n").is_err());
        assert!(ReadyflashConfig::from_toml_str("[install]\nroot_password = \"empty\"\n").is_err());
    }
}
