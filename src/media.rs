use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::util::fs::list_dir_names;

/// A located image file on the install media. Read-only.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InstallImage(PathBuf);

impl InstallImage {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map_or_else(|| self.0.display().to_string(), |n| n.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for InstallImage {
    fn from(value: PathBuf) -> Self {
        Self(value)
    }
}

fn find_in(root: &Path, extension: &str, max_depth: usize) -> Option<PathBuf> {
    jwalk::WalkDir::new(root)
        .max_depth(max_depth)
        .sort(true)
        .into_iter()
        .filter_map(|entry| {
            entry
                .inspect_err(|e| tracing::debug!(?e, "Cannot read entry"))
                .ok()
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == extension))
}

/// Search `roots` in order for the first file with the given extension.
///
/// Every root is searched at most `max_depth` levels deep, visiting entries in
/// sorted order.
#[tracing::instrument(skip(roots))]
pub fn locate<P: AsRef<Path>>(
    roots: &[P],
    extension: &str,
    max_depth: usize,
) -> Option<InstallImage> {
    for root in roots.iter().map(AsRef::as_ref) {
        if !root.exists() {
            tracing::debug!(root = %root.display(), "Search path does not exist");
            continue;
        }
        match list_dir_names(root) {
            Ok(contents) => tracing::debug!(root = %root.display(), ?contents, "Searching"),
            Err(e) => tracing::debug!(root = %root.display(), ?e, "Cannot list search path"),
        }
        if let Some(found) = find_in(root, extension, max_depth) {
            tracing::info!(image = %found.display(), "Found installation image");
            return Some(InstallImage(found));
        }
        tracing::debug!(root = %root.display(), "No image under search path");
    }
    tracing::warn!("No installation image found on any search path");
    None
}

/// Whether something is mounted on `path`, or it already holds an `images` directory.
///
/// An existing but empty mount point is not ready.
fn media_ready(path: &Path) -> bool {
    if path.join("images").is_dir() {
        return true;
    }
    match lsblk::Mount::list() {
        Ok(mut mounts) => mounts.any(|m| m.mountpoint == path),
        Err(e) => {
            tracing::debug!(?e, "Cannot read mount table");
            false
        }
    }
}

/// Wait until the install media is mounted on `path`, checking once a second.
///
/// Returns whether it appeared in time.
#[tracing::instrument]
pub fn wait_for_media(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if media_ready(path) {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!("Install media did not appear, continuing anyway");
            return false;
        }
        tracing::debug!("Waiting for install media");
        std::thread::sleep(Duration::from_secs(1).min(timeout));
    }
}
