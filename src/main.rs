#![warn(rust_2018_idioms)]
use std::{sync::Arc, time::Duration};

use file_guard::Lock;
use readyflash::{
    cfg, consts, disks, error,
    install::{self, InstallEvent, InstallationState, Wizard},
    media,
    prelude::*,
    util::cmd::SystemHost,
};
use tracing_subscriber::prelude::*;

const USAGE: &str = "\
usage: readyflash <MODE>

modes:
  --list-disks         print installable disks as JSON
  --locate-image       print the path of the installation image
  --non-interactive    install using JSON answers read from stdin
                       {\"disk\", \"username\", \"hostname\", \"password\"}
  --reboot             with --non-interactive, reboot once installed";

/// Answers for a headless installation.
#[derive(Deserialize)]
struct Answers {
    disk: PathBuf,
    username: String,
    hostname: String,
    password: String,
    /// Defaults to `password`.
    #[serde(default)]
    confirm: Option<String>,
}

#[allow(clippy::missing_errors_doc)]
fn main() -> Result<()> {
    color_eyre::install()?;
    let cfg = cfg::get_cfg()?;
    let _guard = setup_logs(&cfg.install.log_dir);
    tracing::debug!(?cfg, "Loaded configuration");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let has = |flag: &str| args.iter().any(|arg| arg == flag);
    let host = SystemHost::new(cfg.install.command_timeout());

    if has("--list-disks") {
        let disks = disks::refresh(&host)?;
        println!("{}", serde_json::to_string_pretty(&disks)?);
        return Ok(());
    }
    if has("--locate-image") {
        let image = locate_image(&cfg)?;
        println!("{}", image.path().display());
        return Ok(());
    }
    if has("--non-interactive") {
        tracing::info!("Running in non-interactive mode");
        return non_interactive(cfg, host, has("--reboot"));
    }

    Err(eyre!("No mode given")).with_note(|| USAGE)
}

fn locate_image(cfg: &cfg::ReadyflashConfig) -> Result<media::InstallImage> {
    let media = &cfg.media;
    media::wait_for_media(&media.wait_path, Duration::from_secs(media.wait_secs));
    media::locate(&media.search_paths, &media.extension, media.max_depth)
        .ok_or_else(|| eyre!("No installation image found"))
        .with_note(|| format!("Searched for *.{} in {:?}", media.extension, media.search_paths))
}

#[tracing::instrument(skip_all)]
fn non_interactive(cfg: cfg::ReadyflashConfig, host: SystemHost, reboot: bool) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Err(eyre!("Installing requires root privileges"))
            .with_note(|| "Run readyflash as root or through sudo");
    }

    let lockfile = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(consts::LOCK_PATH)
        .wrap_err_with(|| format!("Cannot open {}", consts::LOCK_PATH))?;
    let _lock = file_guard::try_lock(&lockfile, Lock::Exclusive, 0, 1)
        .wrap_err("Another installer instance is already running")?;

    let image = locate_image(&cfg)
        .inspect_err(|e| tracing::warn!(?e, "Continuing without an image"))
        .ok();
    let answers: Answers =
        serde_json::from_reader(std::io::stdin()).wrap_err("Cannot parse answers from stdin")?;

    let mut wizard = Wizard::new(Arc::new(host), Arc::new(cfg), image);
    let mut yes = |_: &install::InstallationPlan| true;

    wizard.advance(&mut yes)?;
    if wizard.media_missing() {
        bail!(error::WizardError::MediaNotFound);
    }
    wizard.advance(&mut yes)?;
    wizard
        .select_disk(&answers.disk)
        .with_note(|| format!("Available disks: {:?}", wizard.devices()))?;
    wizard.advance(&mut yes)?;
    let form = wizard.form_mut()?;
    form.confirm = answers.confirm.unwrap_or_else(|| answers.password.clone());
    form.username = answers.username;
    form.hostname = answers.hostname;
    form.password = answers.password;
    wizard.advance(&mut yes)?;
    tracing::info!("\n{}", wizard.summary());
    wizard.advance(&mut yes)?;

    while wizard.state() == InstallationState::Installing {
        let Some(event) = wizard.wait_event(Duration::from_secs(1)) else {
            continue;
        };
        println!("{}", serde_json::to_string(&event)?);
        if let InstallEvent::Failed { cause } = event {
            bail!(cause);
        }
    }

    if reboot {
        wizard.request_reboot()?;
    }
    Ok(())
}

/// Returns a logging guard.
///
/// Logs go to stderr, to `readyflash.log` in `log_dir` (or a temporary directory if
/// that cannot be created) and to journald when it is reachable.
///
/// # Panics
/// - cannot create a log directory
/// - a global subscriber is already set
#[allow(clippy::cognitive_complexity)]
fn setup_logs(log_dir: &Path) -> impl std::any::Any {
    let log_dir = std::fs::create_dir_all(log_dir).map_or_else(
        |_| {
            tempfile::Builder::new()
                .prefix("readyflash-logs")
                .tempdir()
                .expect("create readyflash logs tempdir")
                .keep()
        },
        |()| log_dir.to_owned(),
    );
    let file_appender = tracing_appender::rolling::never(&log_dir, consts::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let journald = tracing_journald::layer()
        .map(|l| l.with_syslog_identifier(consts::APP_NAME.to_owned()))
        .ok();
    let has_journald = journald.is_some();
    let sub_builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .pretty()
        .finish()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .with_env_var("READYFLASH_LOG")
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact(),
        )
        .with(journald);
    tracing::subscriber::set_global_default(sub_builder).expect("unable to set global subscriber");
    tracing::info!(
        "{name} {version}",
        name = consts::APP_NAME,
        version = env!("CARGO_PKG_VERSION")
    );
    if has_journald {
        tracing::info!("Logging to journald");
    }
    tracing::info!(
        "Logging to {}",
        log_dir.join(consts::LOG_FILE).display()
    );
    guard
}
