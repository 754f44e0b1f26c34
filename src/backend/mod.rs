pub mod configure;
pub mod deploy;

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use crate::{
    cfg::ReadyflashConfig,
    error::{DeployError, InstallError, WizardError},
    install::InstallationPlan,
    util::cmd::Host,
};

/// Progress sink for one installation.
///
/// Fractions are clamped into `[0, 1]` and never go backwards, whatever the
/// caller reports.
pub struct Progress<'a> {
    sink: Box<dyn FnMut(&str, f64) + Send + 'a>,
    last: f64,
}

impl<'a> Progress<'a> {
    pub fn new<F: FnMut(&str, f64) + Send + 'a>(sink: F) -> Self {
        Self {
            sink: Box::new(sink),
            last: 0.0,
        }
    }

    pub fn report(&mut self, status: &str, fraction: f64) {
        let fraction = if fraction.is_nan() {
            self.last
        } else {
            fraction.clamp(self.last, 1.0)
        };
        self.last = fraction;
        tracing::debug!(status, fraction, "Progress");
        (self.sink)(status, fraction);
    }

    #[must_use]
    pub const fn fraction(&self) -> f64 {
        self.last
    }
}

impl std::fmt::Debug for Progress<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress").field("last", &self.last).finish_non_exhaustive()
    }
}

const OPEN: u8 = 0;
const REQUESTED: u8 = 1;
const FLASHING: u8 = 2;

/// Cancellation handshake between the wizard and the worker.
///
/// A cancel can only be requested until the raw write begins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// The disk is already being written.
    pub fn request(&self) -> Result<(), WizardError> {
        match (self.0).compare_exchange(OPEN, REQUESTED, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) | Err(REQUESTED) => Ok(()),
            Err(_) => Err(WizardError::CancelRejected),
        }
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst) == REQUESTED
    }

    /// Close the cancel window.
    ///
    /// # Errors
    /// A cancel was requested before the window closed.
    pub fn begin_flash(&self) -> Result<(), DeployError> {
        match (self.0).compare_exchange(OPEN, FLASHING, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) | Err(FLASHING) => Ok(()),
            Err(_) => Err(DeployError::Cancelled),
        }
    }
}

/// Deploy the image of `plan` and configure the result.
///
/// # Errors
/// The first fatal step of either phase.
#[tracing::instrument(skip_all, fields(device = %plan.device.devpath.display(), image = %plan.image.path().display()))]
pub fn install(
    host: &dyn Host,
    cfg: &ReadyflashConfig,
    plan: &InstallationPlan,
    progress: &mut Progress<'_>,
    cancel: &CancelToken,
) -> Result<(), InstallError> {
    tracing::info!("Starting installation");
    deploy::deploy(host, &cfg.install, plan, progress, cancel)?;
    configure::configure(host, &cfg.install, &plan.device, &plan.profile, progress)?;
    progress.report("Installation complete!", 1.0);
    tracing::info!("Installation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_monotonic() {
        let mut seen = vec![];
        let mut progress = Progress::new(|_, f| seen.push(f));
        for f in [0.1, 0.3, 0.2, f64::NAN, 1.5, 0.9] {
            progress.report("step", f);
        }
        drop(progress);
        assert_eq!(seen, [0.1, 0.3, 0.3, 0.3, 1.0, 1.0]);
    }

    #[test]
    fn test_cancel_window() {
        let token = CancelToken::new();
        token.request().unwrap();
        assert!(token.is_requested());
        assert!(matches!(token.begin_flash(), Err(DeployError::Cancelled)));

        let token = CancelToken::new();
        token.begin_flash().unwrap();
        assert!(matches!(token.request(), Err(WizardError::CancelRejected)));
    }
}
