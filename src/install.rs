use std::{
    path::Path,
    sync::{mpsc, Arc},
    thread::JoinHandle,
    time::Duration,
};

use itertools::Itertools;
use serde::Serialize;

use crate::{
    backend::{self, CancelToken, Progress},
    cfg::ReadyflashConfig,
    diagnostics, disks,
    disks::BlockDevice,
    error::{InstallError, ValidationError, WizardError},
    media::InstallImage,
    util::cmd::{Cmd, Host, HostExt},
};

/// Wizard steps, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationState {
    /// Try the live system or install it.
    #[default]
    Choice,
    Welcome,
    DiskSelect,
    UserSetup,
    Summary,
    Installing,
    Finished,
}

impl InstallationState {
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Choice => Self::Welcome,
            Self::Welcome => Self::DiskSelect,
            Self::DiskSelect => Self::UserSetup,
            Self::UserSetup => Self::Summary,
            Self::Summary => Self::Installing,
            Self::Installing | Self::Finished => Self::Finished,
        }
    }

    #[must_use]
    pub const fn prev(self) -> Self {
        match self {
            Self::Choice | Self::Welcome => Self::Choice,
            Self::DiskSelect => Self::Welcome,
            Self::UserSetup => Self::DiskSelect,
            Self::Summary => Self::UserSetup,
            Self::Installing => Self::Summary,
            Self::Finished => Self::Installing,
        }
    }

    /// Whether the wizard is past the point of no return.
    #[must_use]
    pub const fn is_locked(self) -> bool {
        matches!(self, Self::Installing | Self::Finished)
    }
}

/// Validated identity of the installed system.
#[derive(Clone, PartialEq, Eq)]
pub struct UserProfile {
    username: String,
    hostname: String,
    password: String,
}

impl UserProfile {
    #[must_use]
    pub fn new(username: &str, hostname: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            hostname: hostname.to_owned(),
            password: password.to_owned(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for UserProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserProfile")
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything an installation needs, frozen when the user confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    pub image: InstallImage,
    pub device: BlockDevice,
    pub profile: UserProfile,
}

/// Raw user input of the account step.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WizardForm {
    pub username: String,
    pub hostname: String,
    pub password: String,
    pub confirm: String,
}

impl std::fmt::Debug for WizardForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WizardForm")
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Check the account step.
///
/// Username and hostname are trimmed; the password is taken as typed.
///
/// # Errors
/// The first missing or inconsistent field, in form order.
pub fn validate_user(form: &WizardForm) -> Result<UserProfile, ValidationError> {
    let username = form.username.trim();
    let hostname = form.hostname.trim();
    if username.is_empty() {
        return Err(ValidationError::EmptyUsername);
    }
    // both end up as arguments or `chpasswd` input lines
    if username.starts_with('-')
        || (username.chars()).any(|c| c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidUsername);
    }
    if hostname.is_empty() {
        return Err(ValidationError::EmptyHostname);
    }
    if form.password.is_empty() {
        return Err(ValidationError::EmptyPassword);
    }
    if form.password.chars().any(char::is_control) {
        return Err(ValidationError::InvalidPassword);
    }
    if form.password != form.confirm {
        return Err(ValidationError::PasswordMismatch);
    }
    Ok(UserProfile::new(username, hostname, &form.password))
}

/// Asks the user whether the disk may be erased.
pub trait Confirm {
    fn confirm_destructive(&mut self, plan: &InstallationPlan) -> bool;
}

impl<F: FnMut(&InstallationPlan) -> bool> Confirm for F {
    fn confirm_destructive(&mut self, plan: &InstallationPlan) -> bool {
        self(plan)
    }
}

/// What the presentation layer is told about a running installation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum InstallEvent {
    Progress { status: String, fraction: f64 },
    Completed,
    Failed { cause: String },
}

enum WorkerMsg {
    Progress(String, f64),
    Done(Result<(), InstallError>),
}

struct Worker {
    rx: mpsc::Receiver<WorkerMsg>,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// The installer wizard.
///
/// Owned by a single control loop; the background worker only ever talks to it
/// through [`Wizard::poll`] and [`Wizard::wait_event`].
pub struct Wizard {
    host: Arc<dyn Host>,
    cfg: Arc<ReadyflashConfig>,
    state: InstallationState,
    image: Option<InstallImage>,
    devices: Vec<BlockDevice>,
    selected: Option<BlockDevice>,
    form: WizardForm,
    plan: Option<Arc<InstallationPlan>>,
    worker: Option<Worker>,
    status: String,
    fraction: f64,
    last_error: Option<String>,
}

impl std::fmt::Debug for Wizard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wizard")
            .field("state", &self.state)
            .field("image", &self.image)
            .field("selected", &self.selected)
            .field("form", &self.form)
            .field("status", &self.status)
            .field("fraction", &self.fraction)
            .finish_non_exhaustive()
    }
}

impl Wizard {
    #[must_use]
    pub fn new(
        host: Arc<dyn Host>,
        cfg: Arc<ReadyflashConfig>,
        image: Option<InstallImage>,
    ) -> Self {
        Self {
            host,
            cfg,
            state: InstallationState::default(),
            image,
            devices: vec![],
            selected: None,
            form: WizardForm::default(),
            plan: None,
            worker: None,
            status: String::new(),
            fraction: 0.0,
            last_error: None,
        }
    }

    /// Leave the current step.
    ///
    /// Returns the new state, which is unchanged when the user declines to erase
    /// the disk on the summary step.
    ///
    /// # Errors
    /// The current step is incomplete, or the wizard cannot move forward from it.
    #[tracing::instrument(skip_all, fields(state = ?self.state))]
    pub fn advance(&mut self, confirm: &mut dyn Confirm) -> Result<InstallationState, WizardError> {
        match self.state {
            InstallationState::Choice => {
                if self.image.is_none() {
                    tracing::warn!("No installation image; installing will not be possible");
                }
            }
            InstallationState::Welcome => {
                if let Err(e) = self.reload_devices() {
                    tracing::error!(?e, "Cannot list disks");
                }
            }
            InstallationState::DiskSelect => {
                if self.selected.is_none() {
                    return Err(ValidationError::NoDiskSelected.into());
                }
            }
            InstallationState::UserSetup => {
                validate_user(&self.form)?;
            }
            InstallationState::Summary => {
                if !self.start(confirm)? {
                    return Ok(self.state);
                }
            }
            InstallationState::Installing => return Err(WizardError::Busy),
            InstallationState::Finished => {
                self.request_reboot()?;
                return Ok(self.state);
            }
        }
        self.state = self.state.next();
        tracing::info!(state = ?self.state, "Advanced");
        Ok(self.state)
    }

    /// Go back one step.
    ///
    /// # Errors
    /// Installation has started.
    pub fn retreat(&mut self) -> Result<InstallationState, WizardError> {
        if self.state.is_locked() {
            return Err(WizardError::NavigationLocked);
        }
        self.state = self.state.prev();
        tracing::debug!(state = ?self.state, "Went back");
        Ok(self.state)
    }

    fn ensure_unlocked(&self) -> Result<(), WizardError> {
        if self.state.is_locked() {
            return Err(WizardError::Busy);
        }
        Ok(())
    }

    fn reload_devices(&mut self) -> Result<(), WizardError> {
        let devices = disks::refresh(&*self.host).map_err(WizardError::Inventory)?;
        if (self.selected.as_ref()).is_some_and(|sel| !devices.contains(sel)) {
            tracing::info!("Selected disk is gone");
            self.selected = None;
        }
        self.devices = devices;
        Ok(())
    }

    /// Re-scan disks. A failed scan keeps the previous list.
    ///
    /// # Errors
    /// Installation has started, or the scan failed.
    pub fn refresh_disks(&mut self) -> Result<&[BlockDevice], WizardError> {
        self.ensure_unlocked()?;
        self.reload_devices()?;
        Ok(&self.devices)
    }

    /// # Errors
    /// Installation has started, or `devpath` is not in the current list.
    pub fn select_disk(&mut self, devpath: &Path) -> Result<(), WizardError> {
        self.ensure_unlocked()?;
        let disk = (self.devices.iter())
            .find(|d| d.devpath == devpath)
            .ok_or_else(|| WizardError::UnknownDisk(devpath.to_owned()))?;
        tracing::info!(%disk, "Selected disk");
        self.selected = Some(disk.clone());
        Ok(())
    }

    /// Edit the account step.
    ///
    /// # Errors
    /// Installation has started.
    pub fn form_mut(&mut self) -> Result<&mut WizardForm, WizardError> {
        self.ensure_unlocked()?;
        Ok(&mut self.form)
    }

    /// Freeze the plan and start the worker. `false` if the user declined.
    fn start(&mut self, confirm: &mut dyn Confirm) -> Result<bool, WizardError> {
        if self.worker.is_some() {
            return Err(WizardError::Busy);
        }
        let image = self.image.clone().ok_or(WizardError::MediaNotFound)?;
        let device = (self.selected.clone()).ok_or(ValidationError::NoDiskSelected)?;
        let profile = validate_user(&self.form)?;
        let plan = InstallationPlan {
            image,
            device,
            profile,
        };
        if !confirm.confirm_destructive(&plan) {
            tracing::info!("User declined to erase the disk");
            return Ok(false);
        }
        let plan = Arc::new(plan);

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let handle = {
            let (host, cfg, plan, cancel) = (
                Arc::clone(&self.host),
                Arc::clone(&self.cfg),
                Arc::clone(&plan),
                cancel.clone(),
            );
            std::thread::Builder::new()
                .name("readyflash-install".to_owned())
                .spawn(move || {
                    let progress_tx = tx.clone();
                    let mut progress = Progress::new(move |status: &str, fraction| {
                        _ = progress_tx.send(WorkerMsg::Progress(status.to_owned(), fraction));
                    });
                    let res = backend::install(&*host, &cfg, &plan, &mut progress, &cancel);
                    if let Err(e) = &res {
                        tracing::error!(?e, "Installation failed");
                        diagnostics::snapshot(&cfg.media.search_paths);
                    }
                    _ = tx.send(WorkerMsg::Done(res));
                })
                .map_err(WizardError::Spawn)?
        };
        tracing::info!(plan = ?plan, "Installation started");
        self.plan = Some(plan);
        self.worker = Some(Worker { rx, cancel, handle });
        self.status.clear();
        self.fraction = 0.0;
        self.last_error = None;
        Ok(true)
    }

    fn handle(&mut self, msg: WorkerMsg) -> InstallEvent {
        match msg {
            WorkerMsg::Progress(status, fraction) => {
                self.status.clone_from(&status);
                self.fraction = fraction;
                InstallEvent::Progress { status, fraction }
            }
            WorkerMsg::Done(res) => {
                if let Some(worker) = self.worker.take() {
                    if worker.handle.join().is_err() {
                        tracing::error!("Installation worker panicked");
                    }
                }
                match res {
                    Ok(()) => {
                        self.state = InstallationState::Finished;
                        self.fraction = 1.0;
                        tracing::info!("Ready to reboot");
                        InstallEvent::Completed
                    }
                    Err(e) => self.fail(&e),
                }
            }
        }
    }

    /// Back to the start with a clean slate. The device list survives.
    fn fail(&mut self, err: &InstallError) -> InstallEvent {
        let cause = std::iter::successors(Some(err as &dyn std::error::Error), |e| e.source())
            .map(ToString::to_string)
            .join(": ");
        tracing::error!(%cause, "Returning to welcome page");
        self.state = InstallationState::Welcome;
        self.selected = None;
        self.form = WizardForm::default();
        self.plan = None;
        self.last_error = Some(cause.clone());
        InstallEvent::Failed { cause }
    }

    /// Wait up to `timeout` for the next message from the worker.
    ///
    /// `None` if there is no worker or nothing arrived in time.
    pub fn wait_event(&mut self, timeout: Duration) -> Option<InstallEvent> {
        let worker = self.worker.as_ref()?;
        let msg = match worker.rx.recv_timeout(timeout) {
            Ok(msg) => msg,
            Err(mpsc::RecvTimeoutError::Timeout) => return None,
            Err(mpsc::RecvTimeoutError::Disconnected) => WorkerMsg::Done(Err(InstallError::WorkerLost)),
        };
        Some(self.handle(msg))
    }

    /// Everything the worker reported since the last call.
    pub fn poll(&mut self) -> Vec<InstallEvent> {
        std::iter::from_fn(|| self.wait_event(Duration::ZERO)).collect()
    }

    /// # Errors
    /// No installation is running, or the disk is already being written.
    pub fn request_cancel_before_flash(&self) -> Result<(), WizardError> {
        let worker = self.worker.as_ref().ok_or(WizardError::CancelRejected)?;
        worker.cancel.request()?;
        tracing::info!("Cancellation requested");
        Ok(())
    }

    /// # Errors
    /// Installation has not finished, or neither reboot command worked.
    pub fn request_reboot(&self) -> Result<(), WizardError> {
        if self.state != InstallationState::Finished {
            return Err(WizardError::NotFinished);
        }
        tracing::info!("Rebooting");
        if let Err(e) = self.host.exec(&Cmd::fatal("systemctl").arg("reboot")) {
            tracing::warn!(?e, "systemctl reboot failed, trying reboot");
            self.host
                .exec(&Cmd::fatal("reboot"))
                .map_err(WizardError::Reboot)?;
        }
        Ok(())
    }

    /// Human readable overview for the summary step.
    #[must_use]
    pub fn summary(&self) -> String {
        let target = self.selected.as_ref().map_or_else(|| "N/A".to_owned(), ToString::to_string);
        let image = self.image.as_ref().map_or_else(|| "N/A".to_owned(), InstallImage::file_name);
        format!(
            "Installation target: {target}\n\
             \n\
             User configuration:\n\
             \x20 • Username: {}\n\
             \x20 • Computer name: {}\n\
             \x20 • Password: {}\n\
             \n\
             Image: {image}\n",
            self.form.username.trim(),
            self.form.hostname.trim(),
            "•".repeat(self.form.password.chars().count()),
        )
    }

    #[must_use]
    pub const fn state(&self) -> InstallationState {
        self.state
    }

    #[must_use]
    pub fn devices(&self) -> &[BlockDevice] {
        &self.devices
    }

    #[must_use]
    pub const fn selected_disk(&self) -> Option<&BlockDevice> {
        self.selected.as_ref()
    }

    #[must_use]
    pub const fn image(&self) -> Option<&InstallImage> {
        self.image.as_ref()
    }

    /// The "no image" indicator of the welcome step.
    #[must_use]
    pub const fn media_missing(&self) -> bool {
        self.image.is_none()
    }

    #[must_use]
    pub fn plan(&self) -> Option<&InstallationPlan> {
        self.plan.as_deref()
    }

    #[must_use]
    pub fn progress(&self) -> (&str, f64) {
        (&self.status, self.fraction)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn reboot_ready(&self) -> bool {
        self.state == InstallationState::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::cmd::{fake::FakeHost, CmdOutput, DeviceLock};

    const LSBLK: &str = "/dev/sda 64G QEMU HARDDISK\n/dev/loop0 1G\n/dev/sr0 4G DVD\n";
    const INFO: &str = r#"{"virtual-size": 1073741824, "format": "qcow2"}"#;
    const WAIT: Duration = Duration::from_secs(10);

    fn yes() -> impl FnMut(&InstallationPlan) -> bool {
        |_: &InstallationPlan| true
    }

    fn wizard(host: FakeHost, image: bool) -> (Arc<FakeHost>, Wizard) {
        let host = Arc::new(host);
        let image = image.then(|| InstallImage::from(std::path::PathBuf::from("/cdrom/images/system.qcow2")));
        let wizard = Wizard::new(
            Arc::clone(&host) as Arc<dyn Host>,
            Arc::new(ReadyflashConfig::default()),
            image,
        );
        (host, wizard)
    }

    fn fill(wizard: &mut Wizard) {
        let form = wizard.form_mut().unwrap();
        form.username = " alice ".into();
        form.hostname = "box".into();
        form.password = "hunter2".into();
        form.confirm = "hunter2".into();
    }

    /// Drive a fresh wizard up to the summary step.
    fn to_summary(wizard: &mut Wizard) {
        wizard.advance(&mut yes()).unwrap();
        wizard.advance(&mut yes()).unwrap();
        wizard.select_disk(Path::new("/dev/sda")).unwrap();
        wizard.advance(&mut yes()).unwrap();
        fill(wizard);
        assert_eq!(wizard.advance(&mut yes()).unwrap(), InstallationState::Summary);
    }

    fn drain(wizard: &mut Wizard) -> Vec<InstallEvent> {
        let mut events = vec![];
        while let Some(ev) = wizard.wait_event(WAIT) {
            let done = !matches!(ev, InstallEvent::Progress { .. });
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_validation_order() {
        let mut form = WizardForm::default();
        assert_eq!(validate_user(&form), Err(ValidationError::EmptyUsername));
        form.username = "  ".into();
        assert_eq!(validate_user(&form), Err(ValidationError::EmptyUsername));
        form.username = "alice".into();
        assert_eq!(validate_user(&form), Err(ValidationError::EmptyHostname));
        form.hostname = "box".into();
        assert_eq!(validate_user(&form), Err(ValidationError::EmptyPassword));
        form.password = "hunter2".into();
        assert_eq!(validate_user(&form), Err(ValidationError::PasswordMismatch));
        form.confirm = "hunter2".into();
        let profile = validate_user(&form).unwrap();
        assert_eq!(profile.username(), "alice");
        assert!(!format!("{profile:?}").contains("hunter2"));
    }

    #[test]
    fn test_validation_rejects_injection() {
        let mut form = WizardForm {
            username: "alice".into(),
            hostname: "box".into(),
            password: "a\nroot:b".into(),
            confirm: "a\nroot:b".into(),
        };
        assert_eq!(validate_user(&form), Err(ValidationError::InvalidPassword));
        form.password = "tab\there".into();
        form.confirm = form.password.clone();
        assert_eq!(validate_user(&form), Err(ValidationError::InvalidPassword));

        form.password = "spaces are fine: ok".into();
        form.confirm = form.password.clone();
        validate_user(&form).unwrap();

        for username in ["-o", "--help", "ali ce", "root:x", "a\nb"] {
            form.username = username.into();
            assert_eq!(validate_user(&form), Err(ValidationError::InvalidUsername), "{username:?}");
        }
    }

    #[test]
    fn test_validation_error_messages() {
        assert_eq!(ValidationError::NoDiskSelected.to_string(), "no disk selected");
        assert_eq!(ValidationError::PasswordMismatch.to_string(), "passwords do not match");
    }

    #[test]
    fn test_disk_step_requires_selection() {
        let (_, mut wizard) = wizard(FakeHost::new().reply("lsblk", 0, LSBLK), true);
        wizard.advance(&mut yes()).unwrap();
        wizard.advance(&mut yes()).unwrap();
        assert_eq!(wizard.devices().len(), 1);
        assert!(matches!(
            wizard.advance(&mut yes()),
            Err(WizardError::Validation(ValidationError::NoDiskSelected))
        ));
        assert_eq!(wizard.state(), InstallationState::DiskSelect);
        assert!(matches!(
            wizard.select_disk(Path::new("/dev/loop0")),
            Err(WizardError::UnknownDisk(_))
        ));
    }

    #[test]
    fn test_retreat() {
        let (_, mut wizard) = wizard(FakeHost::new().reply("lsblk", 0, LSBLK), true);
        assert_eq!(wizard.retreat().unwrap(), InstallationState::Choice);
        to_summary(&mut wizard);
        assert_eq!(wizard.retreat().unwrap(), InstallationState::UserSetup);
        assert_eq!(wizard.retreat().unwrap(), InstallationState::DiskSelect);
        assert_eq!(wizard.retreat().unwrap(), InstallationState::Welcome);
        assert_eq!(wizard.retreat().unwrap(), InstallationState::Choice);
    }

    #[test]
    fn test_declined_confirmation_stays_on_summary() {
        let (host, mut wizard) = wizard(FakeHost::new().reply("lsblk", 0, LSBLK), true);
        to_summary(&mut wizard);
        let mut no = |_: &InstallationPlan| false;
        assert_eq!(wizard.advance(&mut no).unwrap(), InstallationState::Summary);
        assert!(wizard.plan().is_none());
        assert!(!host.called("qemu-img"));
    }

    #[test]
    fn test_no_image() {
        let (host, mut wizard) = wizard(FakeHost::new().reply("lsblk", 0, LSBLK), false);
        assert_eq!(wizard.advance(&mut yes()).unwrap(), InstallationState::Welcome);
        assert!(wizard.media_missing());
        assert_eq!(wizard.retreat().unwrap(), InstallationState::Choice);
        to_summary(&mut wizard);
        assert!(wizard.summary().contains("Image: N/A"));
        assert!(matches!(wizard.advance(&mut yes()), Err(WizardError::MediaNotFound)));
        assert_eq!(wizard.state(), InstallationState::Summary);
        assert!(!host.called("qemu-img"));
    }

    #[test]
    fn test_summary_masks_password() {
        let (_, mut wizard) = wizard(FakeHost::new().reply("lsblk", 0, LSBLK), true);
        to_summary(&mut wizard);
        let summary = wizard.summary();
        assert!(summary.contains("Password: •••••••\n"));
        assert!(summary.contains("Username: alice\n"));
        assert!(summary.contains("Image: system.qcow2"));
        assert!(!summary.contains("hunter2"));
    }

    #[test]
    fn test_happy_path() {
        let host = FakeHost::new()
            .reply("lsblk -dpno", 0, LSBLK)
            .reply("qemu-img info", 0, INFO)
            .reply("qemu-img convert", 0, "(50.00/100%)\n");
        let (host, mut wizard) = wizard(host, true);
        to_summary(&mut wizard);
        assert_eq!(wizard.advance(&mut yes()).unwrap(), InstallationState::Installing);

        // the plan is frozen, navigation and edits are locked
        assert!(matches!(wizard.retreat(), Err(WizardError::NavigationLocked)));
        assert!(matches!(wizard.form_mut(), Err(WizardError::Busy)));
        assert!(matches!(wizard.refresh_disks(), Err(WizardError::Busy)));
        assert!(matches!(wizard.advance(&mut yes()), Err(WizardError::Busy)));
        assert_eq!(wizard.plan().unwrap().profile.username(), "alice");

        let events = drain(&mut wizard);
        assert_eq!(events.last(), Some(&InstallEvent::Completed));
        let fractions = events.iter().filter_map(|e| match e {
            InstallEvent::Progress { fraction, .. } => Some(*fraction),
            _ => None,
        });
        assert!(fractions.tuple_windows().all(|(a, b)| a <= b));
        assert_eq!(wizard.state(), InstallationState::Finished);
        assert!(wizard.reboot_ready());
        assert!(matches!(wizard.retreat(), Err(WizardError::NavigationLocked)));
        assert!(host.calls().iter().all(|c| !c.contains("hunter2")));

        wizard.advance(&mut yes()).unwrap();
        assert!(host.called("systemctl reboot"));
    }

    #[test]
    fn test_reboot_fallback() {
        let host = FakeHost::new()
            .reply("lsblk -dpno", 0, LSBLK)
            .reply("qemu-img info", 0, INFO)
            .fail("systemctl");
        let (host, mut wizard) = wizard(host, true);
        assert!(matches!(wizard.request_reboot(), Err(WizardError::NotFinished)));
        to_summary(&mut wizard);
        wizard.advance(&mut yes()).unwrap();
        drain(&mut wizard);
        wizard.request_reboot().unwrap();
        assert_eq!(host.calls().last().map(String::as_str), Some("reboot"));
    }

    #[test]
    fn test_write_failure_returns_to_welcome() {
        let host = FakeHost::new()
            .reply("lsblk -dpno", 0, LSBLK)
            .reply("qemu-img info", 0, INFO)
            .fail("qemu-img convert");
        let (host, mut wizard) = wizard(host, true);
        to_summary(&mut wizard);
        wizard.advance(&mut yes()).unwrap();

        let events = drain(&mut wizard);
        let Some(InstallEvent::Failed { cause }) = events.last() else {
            panic!("expected failure, got {events:?}");
        };
        assert!(cause.contains("cannot write image to disk"));
        assert_eq!(wizard.state(), InstallationState::Welcome);
        assert!(wizard.selected_disk().is_none());
        assert!(wizard.plan().is_none());
        assert_eq!(wizard.form_mut().unwrap(), &WizardForm::default());
        assert_eq!(wizard.last_error(), Some(cause.as_str()));
        assert!(!host.called("chroot"));
        assert!(!host.called("mount"));
    }

    #[test]
    fn test_cancel_window() {
        let (_, wizard) = wizard(FakeHost::new(), true);
        assert!(matches!(
            wizard.request_cancel_before_flash(),
            Err(WizardError::CancelRejected)
        ));
    }

    #[test]
    fn test_plan_frozen_while_installing() {
        let host = FakeHost::new()
            .reply("lsblk -dpno", 0, LSBLK)
            .reply("qemu-img info", 0, INFO);
        let (host, mut wizard) = wizard(host, true);
        to_summary(&mut wizard);
        wizard.advance(&mut yes()).unwrap();
        let frozen = wizard.plan().cloned().unwrap();

        assert!(matches!(wizard.form_mut(), Err(WizardError::Busy)));
        assert!(matches!(wizard.select_disk(Path::new("/dev/sda")), Err(WizardError::Busy)));
        assert!(matches!(wizard.retreat(), Err(WizardError::NavigationLocked)));
        drain(&mut wizard);

        assert_eq!(wizard.plan(), Some(&frozen));
        assert_eq!(host.stdin_of("chpasswd").first().map(String::as_str), Some("alice:hunter2\n"));
        assert!(wizard.form_mut().is_err());
    }

    /// Dies in the middle of writing the disk without ever reporting back.
    #[derive(Debug)]
    struct CrashingHost(FakeHost);

    impl Host for CrashingHost {
        fn run(&self, cmd: &Cmd, on_line: &mut dyn FnMut(&str)) -> std::io::Result<CmdOutput> {
            assert!(!cmd.to_string().contains("qemu-img convert"), "worker crashed");
            self.0.run(cmd, on_line)
        }

        fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
            self.0.write_file(path, contents)
        }

        fn scratch_dir(&self, prefix: &str) -> std::io::Result<std::path::PathBuf> {
            self.0.scratch_dir(prefix)
        }

        fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
            self.0.remove_dir(path)
        }

        fn lock_device(&self, device: &Path) -> std::io::Result<DeviceLock> {
            self.0.lock_device(device)
        }

        fn exists(&self, path: &Path) -> bool {
            self.0.exists(path)
        }

        fn sleep(&self, duration: Duration) {
            self.0.sleep(duration);
        }
    }

    #[test]
    fn test_lost_worker_fails_once() {
        let host = FakeHost::new()
            .reply("lsblk -dpno", 0, LSBLK)
            .reply("qemu-img info", 0, INFO);
        let mut wizard = Wizard::new(
            Arc::new(CrashingHost(host)),
            Arc::new(ReadyflashConfig::default()),
            Some(InstallImage::from(std::path::PathBuf::from("/cdrom/images/system.qcow2"))),
        );
        to_summary(&mut wizard);
        wizard.advance(&mut yes()).unwrap();

        let events = drain(&mut wizard);
        let terminal: Vec<_> = (events.iter())
            .filter(|e| !matches!(e, InstallEvent::Progress { .. }))
            .collect();
        assert!(
            matches!(terminal.as_slice(), [InstallEvent::Failed { cause }] if cause.contains("without reporting a result")),
            "{events:?}"
        );
        assert_eq!(wizard.state(), InstallationState::Welcome);
        assert!(wizard.plan().is_none());
        assert_eq!(wizard.wait_event(Duration::ZERO), None);
    }
}
