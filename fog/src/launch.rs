//! Launching the emulator process.
//!
//! [`Launcher`] is the seam between a [`Machine`](crate::Machine) and the
//! operating system: it resolves the emulator binary and starts it with a
//! prepared argument list. [`SystemLauncher`] does this for real; tests
//! substitute a recording fake.

#![allow(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, info, warn};

use crate::log::LogStream;

/// Capability to find and start an external executable.
pub trait Launcher: Send + Sync + std::fmt::Debug {
    /// Resolves `program` to an executable path.
    fn resolve(&self, program: &str) -> io::Result<PathBuf>;

    /// Starts `program` with `args` without waiting for it to finish.
    ///
    /// When `output` is given, the child's stderr is copied into it.
    fn spawn(&self, program: &Path, args: &[String], output: Option<LogStream>) -> io::Result<()>;
}

/// Launches processes on the host via `$PATH` lookup and `fork`/`exec`.
///
/// Children inherit no file descriptors beyond stdio. A background thread
/// reaps each child and logs how it exited.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn resolve(&self, program: &str) -> io::Result<PathBuf> {
        search_path(program).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("executable {program:?} not found in $PATH"),
            )
        })
    }

    fn spawn(&self, program: &Path, args: &[String], output: Option<LogStream>) -> io::Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null());
        cmd.stderr(if output.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        pre_exec::apply(&mut cmd);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(pid, program = %program.display(), "spawned process");

        if let (Some(stderr), Some(stream)) = (child.stderr.take(), output) {
            let copier = thread::Builder::new()
                .name(format!("stderr-{pid}"))
                .spawn(move || pipe_stderr(stderr, stream));
            if let Err(e) = copier {
                abandon(child);
                return Err(e);
            }
        }

        // The child is handed over only once the reaper thread exists, so a
        // failed thread spawn still leaves it here to be killed.
        let (tx, rx) = mpsc::channel::<Child>();
        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || {
                if let Ok(child) = rx.recv() {
                    reap(child);
                }
            });
        match reaper {
            Ok(_) => {
                if let Err(mpsc::SendError(child)) = tx.send(child) {
                    reap(child);
                }
                Ok(())
            }
            Err(e) => {
                abandon(child);
                Err(e)
            }
        }
    }
}

/// Copies a child's stderr into a log stream until EOF.
fn pipe_stderr(mut stderr: impl io::Read, mut stream: LogStream) {
    if let Err(e) = io::copy(&mut stderr, &mut stream) {
        warn!(stream = stream.name(), error = %e, "copying process stderr");
    }
}

/// Waits for a child to exit so it does not linger as a zombie.
fn reap(mut child: Child) {
    let pid = child.id();
    match child.wait() {
        Ok(status) if status.success() => debug!(pid, "process exited"),
        Ok(status) => warn!(pid, %status, "process exited abnormally"),
        Err(e) => warn!(pid, error = %e, "waiting for process"),
    }
}

/// Kills a child that cannot be supervised and waits for it to exit.
fn abandon(mut child: Child) -> Option<ExitStatus> {
    let pid = child.id();
    if let Err(e) = child.kill() {
        warn!(pid, error = %e, "killing unsupervised process");
    }
    child
        .wait()
        .inspect_err(|e| warn!(pid, error = %e, "waiting for process"))
        .ok()
}

/// Searches `$PATH` for an executable file named `name`.
///
/// Names containing a `/` are checked as given.
fn search_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let p = PathBuf::from(name);
        return is_executable(&p).then_some(p);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

/// Returns `true` if `path` is a regular file with an execute bit set.
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

mod pre_exec {
    //! Hardening applied between `fork()` and `exec()`: the emulator must
    //! not inherit the supervisor's sockets, log files or pipes, so every
    //! descriptor ≥ 3 is marked close-on-exec.
    //!
    //! The descriptors are not closed outright: std reports `exec` failures
    //! to the parent through a CLOEXEC pipe in that range.
    //!
    //! No `PR_SET_PDEATHSIG` here: it fires when the forking *thread*
    //! exits, not the process.

    use std::os::unix::process::CommandExt;
    use std::process::Command;

    /// `CLOSE_RANGE_CLOEXEC` from `<linux/close_range.h>`.
    #[cfg(target_os = "linux")]
    const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

    /// Installs the pre-exec hook on `cmd`.
    pub(super) fn apply(cmd: &mut Command) {
        // SAFETY: the hook only makes async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(|| {
                cloexec_inherited_fds();
                Ok(())
            });
        }
    }

    /// Sets `FD_CLOEXEC` on all file descriptors ≥ 3.
    fn cloexec_inherited_fds() {
        // CLOSE_RANGE_CLOEXEC exists since Linux 5.11.
        #[cfg(target_os = "linux")]
        {
            // SAFETY: close_range is async-signal-safe.
            let ret = unsafe {
                libc::syscall(libc::SYS_close_range, 3_u32, u32::MAX, CLOSE_RANGE_CLOEXEC)
            };
            if ret == 0 {
                return;
            }
        }

        // SAFETY: sysconf is async-signal-safe.
        let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
        #[allow(clippy::cast_possible_truncation)]
        let limit = if max_fd > 0 { max_fd as i32 } else { 1024 };
        for fd in 3..limit {
            // SAFETY: fcntl is async-signal-safe. EBADF on unused slots is
            // ignored.
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn resolves_shell_from_path() {
        let sh = SystemLauncher.resolve("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(sh.ends_with("sh"));
    }

    #[test]
    fn missing_binary_is_not_found() {
        let err = SystemLauncher
            .resolve("fog-definitely-not-a-real-binary")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable(&path));

        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&path));
        assert_eq!(search_path(path.to_str().unwrap()), Some(path));
    }

    #[test]
    fn spawn_does_not_wait_for_exit() {
        let sh = SystemLauncher.resolve("sh").unwrap();
        let start = std::time::Instant::now();
        SystemLauncher
            .spawn(&sh, &["-c".into(), "sleep 2".into()], None)
            .unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn exec_failure_after_fork_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken-interpreter");
        fs::write(&path, "#!/nonexistent/interpreter\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let err = SystemLauncher.spawn(&path, &[], None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let start = std::time::Instant::now();
        let status = abandon(child).unwrap();
        assert!(!status.success());
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stderr_reaches_the_log_stream() {
        use crate::log::testing::Capture;
        use crate::log::{LogMux, Style};

        let capture = Capture::default();
        let mux = LogMux::builder(capture.clone())
            .style(Style::Plain)
            .build()
            .unwrap();
        let stream = mux.stream("qemu");

        let sh = SystemLauncher.resolve("sh").unwrap();
        SystemLauncher
            .spawn(&sh, &["-c".into(), "echo boom >&2".into()], Some(stream))
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        mux.flush().unwrap();
        let out = String::from_utf8(capture.writes().concat()).unwrap();
        assert!(out.contains("boom"), "{out:?}");
    }
}
