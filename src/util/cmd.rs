//! Process boundary.
//!
//! Everything the installer does to the machine goes through a [`Host`]: spawning
//! external tools, writing files into the target root, creating and removing the
//! scoped mount point. Each [`Cmd`] carries its own failure tier, so whether a
//! non-zero exit aborts the enclosing operation is decided where the command is
//! built, not where it is run.
use std::{
    fmt,
    io::{BufReader, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::mpsc,
    time::{Duration, Instant},
};

use thiserror::Error;

/// How often a running child is checked for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Non-zero exit is an error for the caller.
    Fatal,
    /// Non-zero exit is logged and otherwise ignored.
    BestEffort,
}

/// A string that must never end up in logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<Secret>,
    timeout: Option<Duration>,
    tier: Tier,
}

impl Cmd {
    fn new(program: &str, tier: Tier) -> Self {
        Self {
            program: program.to_owned(),
            args: vec![],
            stdin: None,
            timeout: None,
            tier,
        }
    }

    /// A command whose failure aborts the step it belongs to.
    #[must_use]
    pub fn fatal(program: &str) -> Self {
        Self::new(program, Tier::Fatal)
    }

    /// A command whose failure is only logged.
    #[must_use]
    pub fn best_effort(program: &str) -> Self {
        Self::new(program, Tier::BestEffort)
    }

    #[must_use]
    pub fn arg<S: AsRef<std::ffi::OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend((args.into_iter()).map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    /// Feed `secret` to the child's stdin. It is never part of the command line.
    #[must_use]
    pub fn stdin_secret(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run this command inside `root` through `chroot`.
    #[must_use]
    pub fn chrooted(self, root: &Path) -> Self {
        let mut args = vec![root.to_string_lossy().into_owned(), self.program];
        args.extend(self.args);
        Self {
            program: "chroot".to_owned(),
            args,
            ..self
        }
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub const fn stdin(&self) -> Option<&Secret> {
        self.stdin.as_ref()
    }

    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub const fn wait_limit(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// `None` when the process was killed by a signal or never started.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("fail to execute `{cmd}`")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{cmd}` exited with status {code:?}: {stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{cmd}` did not finish in time and was killed")]
    Timeout { cmd: String },
}

/// Held for as long as a device is exclusively ours.
pub type DeviceLock = Box<dyn std::any::Any + Send>;

/// The installer's only way of touching the system.
pub trait Host: Send + Sync {
    /// Run `cmd` to completion or until its wait limit, calling `on_line` for every
    /// line (split on `\n` and `\r`) the child prints on stdout.
    ///
    /// # Errors
    /// The child could not be spawned, or it outlived its wait limit
    /// ([`std::io::ErrorKind::TimedOut`]). A non-zero exit is not an error here.
    fn run(&self, cmd: &Cmd, on_line: &mut dyn FnMut(&str)) -> std::io::Result<CmdOutput>;

    /// # Errors
    /// The file or one of its parents cannot be written.
    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()>;

    /// Create a fresh, empty directory to mount things on.
    ///
    /// # Errors
    /// The directory cannot be created.
    fn scratch_dir(&self, prefix: &str) -> std::io::Result<PathBuf>;

    /// Remove an empty directory. Never recursive.
    ///
    /// # Errors
    /// The directory is missing or not empty.
    fn remove_dir(&self, path: &Path) -> std::io::Result<()>;

    /// Take an exclusive lock on `device`, released when the guard is dropped.
    ///
    /// # Errors
    /// The device cannot be opened, or another process already holds the lock.
    fn lock_device(&self, device: &Path) -> std::io::Result<DeviceLock>;

    fn exists(&self, path: &Path) -> bool;

    fn sleep(&self, duration: Duration);
}

/// Failure-tier handling on top of [`Host::run`].
pub trait HostExt {
    /// Run `cmd` and apply its tier.
    ///
    /// A [`Tier::BestEffort`] command never returns `Err`: failures are logged and
    /// turned into an unsuccessful [`CmdOutput`].
    ///
    /// # Errors
    /// A [`Tier::Fatal`] command that fails to spawn, exits non-zero or times out.
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput, CmdError>;

    /// Like [`HostExt::exec`], forwarding stdout lines as they arrive.
    ///
    /// # Errors
    /// See [`HostExt::exec`].
    fn exec_streaming(&self, cmd: &Cmd, on_line: &mut dyn FnMut(&str))
        -> Result<CmdOutput, CmdError>;
}

impl<H: Host + ?Sized> HostExt for H {
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput, CmdError> {
        self.exec_streaming(cmd, &mut |_| {})
    }

    #[tracing::instrument(skip_all, fields(cmd = %cmd))]
    fn exec_streaming(
        &self,
        cmd: &Cmd,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<CmdOutput, CmdError> {
        tracing::debug!(tier = ?cmd.tier(), "Executing");
        let err = match self.run(cmd, on_line) {
            Ok(out) if out.success() => return Ok(out),
            Ok(out) => CmdError::Failed {
                cmd: cmd.to_string(),
                code: out.code,
                stderr: out.stderr.trim().to_owned(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => CmdError::Timeout {
                cmd: cmd.to_string(),
            },
            Err(source) => CmdError::Spawn {
                cmd: cmd.to_string(),
                source,
            },
        };
        match cmd.tier() {
            Tier::Fatal => {
                tracing::error!(%err, "Command failed");
                Err(err)
            }
            Tier::BestEffort => {
                tracing::warn!(%err, "Ignoring failure of best-effort command");
                Ok(CmdOutput {
                    code: match &err {
                        CmdError::Failed { code, .. } => *code,
                        _ => None,
                    },
                    stderr: err.to_string(),
                    ..CmdOutput::default()
                })
            }
        }
    }
}

/// The real machine.
#[derive(Debug, Clone)]
pub struct SystemHost {
    default_timeout: Duration,
}

impl SystemHost {
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

enum Stream {
    Stdout,
    Stderr,
}

/// Forward lines from `reader`, treating `\r` as a line break too so progress
/// meters that redraw in place still come through.
fn forward_lines<R: Read>(reader: R, stream: &Stream, tx: &mpsc::Sender<(bool, String)>) {
    let is_stdout = matches!(stream, Stream::Stdout);
    let mut reader = BufReader::new(reader);
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    let mut flush = |line: &mut Vec<u8>| {
        if !line.is_empty() {
            let text = strip_ansi_escapes::strip_str(String::from_utf8_lossy(line));
            _ = tx.send((is_stdout, text));
            line.clear();
        }
    };
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in buf.iter().take(n) {
            if b == b'\n' || b == b'\r' {
                flush(&mut line);
            } else {
                line.push(b);
            }
        }
    }
    flush(&mut line);
}

impl Host for SystemHost {
    fn run(&self, cmd: &Cmd, on_line: &mut dyn FnMut(&str)) -> std::io::Result<CmdOutput> {
        let limit = cmd.wait_limit().unwrap_or(self.default_timeout);
        let mut child = Command::new(cmd.program())
            .args(cmd.arguments())
            .stdin(if cmd.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(secret) = cmd.stdin() {
            // dropped at the end of the block, which closes the pipe
            let mut stdin = (child.stdin.take())
                .ok_or_else(|| std::io::Error::other("child stdin is not piped"))?;
            stdin.write_all(secret.expose().as_bytes())?;
        }
        let stdout = (child.stdout.take())
            .ok_or_else(|| std::io::Error::other("child stdout is not piped"))?;
        let stderr = (child.stderr.take())
            .ok_or_else(|| std::io::Error::other("child stderr is not piped"))?;

        let deadline = Instant::now() + limit;
        let (tx, rx) = mpsc::channel();
        let mut out = CmdOutput::default();
        let mut handle = |(is_stdout, line): (bool, String)| {
            if is_stdout {
                tracing::trace!(" │ {line}");
                on_line(&line);
                out.stdout += &line;
                out.stdout.push('\n');
            } else {
                tracing::trace!("!│ {line}");
                out.stderr += &line;
                out.stderr.push('\n');
            }
        };

        let status = std::thread::scope(|s| {
            let stderr_tx = tx.clone();
            s.spawn(move || forward_lines(stdout, &Stream::Stdout, &tx));
            s.spawn(move || forward_lines(stderr, &Stream::Stderr, &stderr_tx));

            loop {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => handle(line),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(POLL_INTERVAL),
                }
                if let Some(status) = child.try_wait()? {
                    // readers finish once the pipes close
                    rx.iter().for_each(&mut handle);
                    return Ok(status);
                }
                if Instant::now() >= deadline {
                    tracing::warn!(cmd = %cmd, ?limit, "Killing command that outlived its wait limit");
                    _ = child.kill();
                    _ = child.wait();
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("`{cmd}` timed out"),
                    ));
                }
            }
        })?;

        out.code = status.code();
        Ok(out)
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    fn scratch_dir(&self, prefix: &str) -> std::io::Result<PathBuf> {
        // kept: removal must never recurse into a filesystem that is still mounted
        Ok(tempfile::Builder::new().prefix(prefix).tempdir()?.keep())
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_dir(path)
    }

    fn lock_device(&self, device: &Path) -> std::io::Result<DeviceLock> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)?;
        let guard = file_guard::try_lock(Box::new(file), file_guard::Lock::Exclusive, 0, 1)?;
        Ok(Box::new(guard))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hides_stdin() {
        let cmd = Cmd::fatal("chroot")
            .arg("/mnt")
            .arg("chpasswd")
            .stdin_secret(Secret::new("alice:hunter2\n"));
        assert_eq!(cmd.to_string(), "chroot /mnt chpasswd");
        assert!(!format!("{cmd:?}").contains("hunter2"));
    }

    #[test]
    fn test_best_effort_never_errors() {
        let host = fake::FakeHost::new().fail("umount");
        let out = host.exec(&Cmd::best_effort("umount").arg("/dev/sda1")).unwrap();
        assert!(!out.success());
        assert_eq!(out.code, Some(1));
    }

    #[test]
    fn test_fatal_errors_on_nonzero() {
        let host = fake::FakeHost::new().fail("useradd");
        let err = host.exec(&Cmd::fatal("useradd").arg("alice")).unwrap_err();
        assert!(matches!(err, CmdError::Failed { code: Some(1), .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_host_streams_lines() {
        let host = SystemHost::new(Duration::from_secs(10));
        let mut seen = vec![];
        let out = host
            .exec_streaming(
                &Cmd::fatal("sh").args(["-c", "printf 'a\\rb\\nc\\n'; echo oops >&2"]),
                &mut |l| seen.push(l.to_owned()),
            )
            .unwrap();
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_host_stdin() {
        let host = SystemHost::new(Duration::from_secs(10));
        let out = host
            .exec(&Cmd::fatal("cat").stdin_secret(Secret::new("hello")))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_host_bounded_wait() {
        let host = SystemHost::new(Duration::from_secs(10));
        let started = Instant::now();
        let err = host
            .exec(&Cmd::fatal("sleep").arg("5").timeout(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, CmdError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
