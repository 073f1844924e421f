//! The process handle abstraction and the data model behind each supervised
//! entry.

use crate::error::{Result, SupervisorError};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Declarative, persistent description of a supervised process.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub pidfile: PathBuf,
    pub outfile: PathBuf,
    pub errfile: PathBuf,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub source_path: Option<PathBuf>,
}

impl ProcessSpec {
    /// Derives the `<sys>/<name>/...` artifact paths from `sys_folder` and `name`.
    pub fn new(sys_folder: &std::path::Path, name: impl Into<String>, command: PathBuf, args: Vec<String>) -> Self {
        let name = name.into();
        let workdir = sys_folder.join(&name);
        let pidfile = workdir.join(format!("{name}.pid"));
        let outfile = workdir.join(format!("{name}.out"));
        let errfile = workdir.join(format!("{name}.err"));
        ProcessSpec {
            name,
            command,
            args,
            workdir,
            pidfile,
            outfile,
            errfile,
            keep_alive: false,
            source_path: None,
        }
    }
}

/// Free-form status label: `{started, running, asked to stop, stopped}`.
///
/// Kept as a string wrapper rather than a closed enum because the on-disk
/// schema persists it as-is and downstream tooling treats it as opaque text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StatusLabel(pub String);

impl StatusLabel {
    pub fn started() -> Self {
        StatusLabel("started".to_string())
    }
    pub fn running() -> Self {
        StatusLabel("running".to_string())
    }
    pub fn asked_to_stop() -> Self {
        StatusLabel("asked to stop".to_string())
    }
    pub fn stopped() -> Self {
        StatusLabel("stopped".to_string())
    }
}

impl Default for StatusLabel {
    fn default() -> Self {
        StatusLabel::stopped()
    }
}

/// Transient fields mutated during execution.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ProcessRuntime {
    /// Current OS pid, or `None` for "not running". The on-disk format
    /// persists this informationally only; it is never trusted on reload
    /// for signaling.
    pub pid: Option<u32>,
    pub status_label: StatusLabel,
    pub restart_count: u64,
}

/// The outcome of waiting on a child.
#[derive(Clone, Debug)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

/// The capability set every supervised process must expose: `{Start, Stop,
/// Wait, IsAlive, Delete}` plus the identifier/status accessors, which here
/// live on [`crate::supervisor::ProcessRecord`] instead since they're plain
/// data.
///
/// There is exactly one production implementor, [`NativeProcess`]. A second,
/// [`testing::FakeProcess`], drives the supervise loop deterministically in
/// tests without touching the kernel.
#[async_trait::async_trait]
pub trait SupervisedProcess: Send + Sync {
    /// Spawns the child described by `spec`. On success, records the pid.
    async fn start(&self, spec: &ProcessSpec) -> Result<u32>;

    /// Blocks (asynchronously) until the child's state changes. Consumes the
    /// in-flight child handle; callers must not call `wait` twice without an
    /// intervening `start`.
    async fn wait(&self) -> Result<ExitOutcome>;

    /// Sends SIGTERM. Does not wait for the child to exit.
    fn graceful_stop(&self) -> Result<()>;

    /// Sends SIGKILL. Does not wait for the child to exit.
    fn force_stop(&self) -> Result<()>;

    /// Delivers a null signal to check liveness.
    fn is_alive(&self) -> bool;

    /// Removes `outfile`, `errfile`, and `workdir` entirely.
    async fn delete(&self, spec: &ProcessSpec) -> Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// The production [`SupervisedProcess`]: a real OS child managed through
/// `tokio::process`.
#[derive(Clone, Default)]
pub struct NativeProcess {
    pid: Arc<AtomicI32>,
    child: Arc<AsyncMutex<Option<tokio::process::Child>>>,
}

const NO_PID: i32 = 0;

impl NativeProcess {
    pub fn new() -> Self {
        NativeProcess {
            pid: Arc::new(AtomicI32::new(NO_PID)),
            child: Arc::new(AsyncMutex::new(None)),
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.map(|p| p as i32).unwrap_or(NO_PID), Ordering::SeqCst);
    }

    fn signal(&self, signal: libc::c_int) -> Result<()> {
        let pid = self.pid();
        match pid {
            None => Err(SupervisorError::NoProcess { name: String::new() }),
            Some(pid) => {
                // SAFETY: kill(2) with a PID we own and a valid signal number.
                let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
                if rc == 0 {
                    Ok(())
                } else {
                    Err(SupervisorError::IoFailed {
                        path: PathBuf::new(),
                        source: std::io::Error::last_os_error(),
                    })
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl SupervisedProcess for NativeProcess {
    async fn start(&self, spec: &ProcessSpec) -> Result<u32> {
        let outfile = open_append(&spec.outfile)?;
        let errfile = open_append(&spec.errfile)?;

        let mut command = tokio::process::Command::new(&spec.command);
        command
            .arg0(&spec.name)
            .args(&spec.args)
            .stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::from(outfile))
            .stderr(std::process::Stdio::from(errfile));

        let child = command.spawn().map_err(|source| SupervisorError::SpawnFailed {
            name: spec.name.clone(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            name: spec.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "child has no pid"),
        })?;

        tokio::fs::write(&spec.pidfile, pid.to_string())
            .await
            .map_err(|source| SupervisorError::IoFailed {
                path: spec.pidfile.clone(),
                source,
            })?;

        self.set_pid(Some(pid));
        *self.child.lock().await = Some(child);
        Ok(pid)
    }

    async fn wait(&self) -> Result<ExitOutcome> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut().ok_or(SupervisorError::NoProcess { name: String::new() })?;
        let status = child.wait().await.map_err(|source| SupervisorError::IoFailed {
            path: PathBuf::new(),
            source,
        })?;
        Ok(ExitOutcome {
            success: status.success(),
            code: status.code(),
        })
    }

    fn graceful_stop(&self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    /// Sends SIGKILL only, symmetric with `graceful_stop`. Clearing the pid,
    /// flipping the status label, and removing the pidfile happen once the
    /// caller's `wait` actually observes the exit (the Supervisor does this
    /// in its `stop` path; `delete` removes the pidfile's directory outright).
    /// Duplicating that bookkeeping here would race the real exit.
    fn force_stop(&self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn is_alive(&self) -> bool {
        match self.pid() {
            None => false,
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
        }
    }

    async fn delete(&self, spec: &ProcessSpec) -> Result<()> {
        *self.child.lock().await = None;
        self.set_pid(None);
        remove_if_exists(&spec.outfile)?;
        remove_if_exists(&spec.errfile)?;
        remove_dir_if_exists(&spec.workdir)?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        let raw = self.pid.load(Ordering::SeqCst);
        if raw == NO_PID {
            None
        } else {
            Some(raw as u32)
        }
    }
}

fn open_append(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| SupervisorError::IoFailed {
            path: path.to_path_buf(),
            source,
        })
}

fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::IoFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_dir_if_exists(path: &std::path::Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::IoFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// A test double for [`SupervisedProcess`] that never touches the kernel.
/// Lets the supervise loop, Watcher, and Supervisor be driven deterministically
/// in tests.
pub mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// A fake child whose exit can be triggered by the test from outside.
    pub struct FakeProcess {
        pid: Arc<AtomicI32>,
        alive: Arc<std::sync::atomic::AtomicBool>,
        exit_rx: Arc<AsyncMutex<Option<mpsc::Receiver<ExitOutcome>>>>,
        exit_tx: mpsc::Sender<ExitOutcome>,
        next_pid: u32,
    }

    impl FakeProcess {
        pub fn new(next_pid: u32) -> Self {
            let (exit_tx, exit_rx) = mpsc::channel(1);
            FakeProcess {
                pid: Arc::new(AtomicI32::new(NO_PID)),
                alive: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                exit_rx: Arc::new(AsyncMutex::new(Some(exit_rx))),
                exit_tx,
                next_pid,
            }
        }

        /// Simulates the child exiting, as if by an external signal.
        pub async fn kill_externally(&self, code: Option<i32>) {
            self.alive.store(false, Ordering::SeqCst);
            let _ = self
                .exit_tx
                .send(ExitOutcome {
                    success: code == Some(0),
                    code,
                })
                .await;
        }
    }

    impl Clone for FakeProcess {
        fn clone(&self) -> Self {
            FakeProcess {
                pid: self.pid.clone(),
                alive: self.alive.clone(),
                exit_rx: self.exit_rx.clone(),
                exit_tx: self.exit_tx.clone(),
                next_pid: self.next_pid,
            }
        }
    }

    #[async_trait::async_trait]
    impl SupervisedProcess for FakeProcess {
        async fn start(&self, _spec: &ProcessSpec) -> Result<u32> {
            self.pid.store(self.next_pid as i32, Ordering::SeqCst);
            self.alive.store(true, Ordering::SeqCst);
            // Drain any stale exit notification from a previous run.
            if let Some(rx) = self.exit_rx.lock().await.as_mut() {
                while rx.try_recv().is_ok() {}
            }
            Ok(self.next_pid)
        }

        async fn wait(&self) -> Result<ExitOutcome> {
            let mut guard = self.exit_rx.lock().await;
            let rx = guard.as_mut().ok_or(SupervisorError::NoProcess { name: String::new() })?;
            let outcome = rx.recv().await.ok_or(SupervisorError::NoProcess { name: String::new() })?;
            Ok(outcome)
        }

        fn graceful_stop(&self) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            let tx = self.exit_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(ExitOutcome { success: true, code: Some(0) }).await;
            });
            Ok(())
        }

        fn force_stop(&self) -> Result<()> {
            self.graceful_stop()
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn delete(&self, _spec: &ProcessSpec) -> Result<()> {
            self.pid.store(NO_PID, Ordering::SeqCst);
            Ok(())
        }

        fn pid(&self) -> Option<u32> {
            let raw = self.pid.load(Ordering::SeqCst);
            if raw == NO_PID {
                None
            } else {
                Some(raw as u32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_spec_derives_artifact_paths() {
        let spec = ProcessSpec::new(std::path::Path::new("/tmp/s"), "a", PathBuf::from("/bin/true"), vec![]);
        assert_eq!(spec.workdir, PathBuf::from("/tmp/s/a"));
        assert_eq!(spec.pidfile, PathBuf::from("/tmp/s/a/a.pid"));
        assert_eq!(spec.outfile, PathBuf::from("/tmp/s/a/a.out"));
        assert_eq!(spec.errfile, PathBuf::from("/tmp/s/a/a.err"));
    }

    #[tokio::test]
    async fn fake_process_reports_external_kill() {
        use testing::FakeProcess;
        let spec = ProcessSpec::new(std::path::Path::new("/tmp/s"), "a", PathBuf::from("/bin/true"), vec![]);
        let proc = FakeProcess::new(42);
        let pid = proc.start(&spec).await.unwrap();
        assert_eq!(pid, 42);
        assert!(proc.is_alive());

        let waiter = proc.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        proc.kill_externally(Some(9)).await;
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.code, Some(9));
        assert!(!proc.is_alive());
    }
}
