//! Supervisor: holds the registry, owns the Watcher, and runs the three
//! background loops that make keep-alive and periodic persistence happen
//! without an explicit caller.

use crate::config::{ConfigFile, ConfigProcessEntry, ConfigStore};
use crate::error::{Result, SupervisorError};
use crate::preparable::Preparable;
use crate::process::{ProcessRuntime, ProcessSpec, StatusLabel, SupervisedProcess};
use crate::watcher::Watcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Builds a fresh, unstarted handle for a process. Each record needs its own
/// handle (the pid/child state inside a [`SupervisedProcess`] impl is
/// per-instance), so the Supervisor is handed a factory rather than a single
/// shared instance.
pub type ProcessFactory = Arc<dyn Fn() -> Arc<dyn SupervisedProcess> + Send + Sync>;

/// A live entry in the registry: what to run, its current runtime state, and
/// the handle used to signal/wait on it.
pub struct ProcessRecord {
    pub spec: ProcessSpec,
    pub runtime: ProcessRuntime,
    pub process: Arc<dyn SupervisedProcess>,
}

/// A single row of [`Supervisor::list`]'s output, also what `monit` returns.
#[derive(Clone, Debug)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub status_label: StatusLabel,
    pub keep_alive: bool,
    pub restart_count: u64,
}

/// Owns the registry and the Watcher, and exposes the control operations.
/// Every operation acquires the registry lock at entry and releases it no
/// later than its own return, except `stop` which releases it for the
/// duration of the child's shutdown.
pub struct Supervisor {
    registry: Mutex<HashMap<String, ProcessRecord>>,
    watcher: Watcher,
    sys_folder: PathBuf,
    config_path: PathBuf,
    pid_file: PathBuf,
    out_file: PathBuf,
    err_file: PathBuf,
    preparable: Arc<dyn Preparable>,
    process_factory: ProcessFactory,
}

impl Supervisor {
    /// Loads `<sys_folder>/config.toml` (fatal if missing), rebuilds the
    /// registry from it, and revives every `keep_alive` entry.
    /// Does not start background loops; call [`Supervisor::spawn_background_tasks`]
    /// once the instance is wrapped in an `Arc`.
    pub async fn init(
        sys_folder: PathBuf,
        pid_file: PathBuf,
        out_file: PathBuf,
        err_file: PathBuf,
        preparable: Arc<dyn Preparable>,
        process_factory: ProcessFactory,
    ) -> Result<Arc<Supervisor>> {
        let config_path = sys_folder.join("config.toml");
        let config = ConfigStore::read_into(&config_path)?;

        let mut registry = HashMap::new();
        for (name, entry) in config.procs {
            registry.insert(
                name,
                ProcessRecord {
                    spec: entry.spec,
                    runtime: ProcessRuntime {
                        pid: None,
                        status_label: StatusLabel::stopped(),
                        restart_count: entry.restart_count,
                    },
                    process: (process_factory)(),
                },
            );
        }

        let supervisor = Arc::new(Supervisor {
            registry: Mutex::new(registry),
            watcher: Watcher::new(),
            sys_folder,
            config_path,
            pid_file,
            out_file,
            err_file,
            preparable,
            process_factory,
        });

        supervisor.revive().await;
        Ok(supervisor)
    }

    pub fn sys_folder(&self) -> &Path {
        &self.sys_folder
    }

    /// Spawns the supervise loop, the periodic save loop, and the periodic
    /// status refresh loop. Returns their join handles so a caller can abort
    /// them on shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).supervise_loop()),
            tokio::spawn(Arc::clone(self).periodic_save_loop()),
            tokio::spawn(Arc::clone(self).periodic_status_loop()),
        ]
    }

    /// Consumes Watcher restart events: keep-alive processes are restarted,
    /// everything else just has its runtime fields reconciled to `stopped`.
    async fn supervise_loop(self: Arc<Self>) {
        while let Some(signal) = self.watcher.next_event().await {
            let name = signal.name;
            let keep_alive = {
                let mut registry = self.registry.lock().await;
                match registry.get_mut(&name) {
                    Some(record) => {
                        if record.process.is_alive() {
                            warn!(%name, "watcher reported exit but process still reports alive");
                        }
                        record.runtime.pid = None;
                        if record.spec.keep_alive {
                            record.runtime.restart_count += 1;
                            true
                        } else {
                            record.runtime.status_label = StatusLabel::stopped();
                            false
                        }
                    }
                    None => continue,
                }
            };

            if keep_alive {
                info!(%name, "restarting keep-alive process");
                if let Err(error) = self.start(&name).await {
                    warn!(%name, %error, "failed to restart process");
                }
            }
        }
    }

    async fn periodic_save_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SAVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            ticker.tick().await;
            if let Err(error) = self.save().await {
                warn!(%error, "periodic config save failed");
            }
        }
    }

    async fn periodic_status_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATUS_REFRESH_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut registry = self.registry.lock().await;
            for record in registry.values_mut() {
                if record.process.is_alive() {
                    record.runtime.status_label = StatusLabel::running();
                } else {
                    record.runtime.pid = None;
                    record.runtime.status_label = StatusLabel::stopped();
                }
            }
        }
    }

    /// Builds and registers a new process. The build itself runs without the
    /// registry lock held; only the insert-and-start step is serialized
    /// against other control operations.
    pub async fn prepare_and_run(
        &self,
        source_path: PathBuf,
        name: String,
        keep_alive: bool,
        args: Vec<String>,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(SupervisorError::BuildFailed {
                name,
                output: "process name must not be empty".to_string(),
            });
        }

        let build = self
            .preparable
            .prepare(&source_path, &name, &self.sys_folder)
            .await
            .map_err(|e| SupervisorError::BuildFailed {
                name: name.clone(),
                output: e.output,
            })?;

        let mut registry = self.registry.lock().await;
        if registry.contains_key(&name) {
            return Err(SupervisorError::AlreadyExists { name });
        }

        let mut spec = ProcessSpec::new(&self.sys_folder, name.clone(), build.executable, args);
        spec.keep_alive = keep_alive;
        spec.source_path = Some(source_path);

        tokio::fs::create_dir_all(&spec.workdir)
            .await
            .map_err(|source| SupervisorError::IoFailed {
                path: spec.workdir.clone(),
                source,
            })?;

        let process = (self.process_factory)();
        let pid = process.start(&spec).await?;

        registry.insert(
            name.clone(),
            ProcessRecord {
                spec,
                runtime: ProcessRuntime {
                    pid: Some(pid),
                    status_label: StatusLabel::running(),
                    restart_count: 0,
                },
                process: process.clone(),
            },
        );
        self.watcher.add(name.clone(), process).await;
        drop(registry);

        self.save().await?;
        Ok(build.output)
    }

    /// Starts `name` if it isn't already alive. Idempotent: calling it again
    /// on an already-running process is a no-op.
    pub async fn start(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let record = registry
            .get_mut(name)
            .ok_or_else(|| SupervisorError::Unknown { name: name.to_string() })?;

        if record.process.is_alive() {
            return Ok(());
        }

        let pid = record.process.start(&record.spec).await?;
        record.runtime.pid = Some(pid);
        record.runtime.status_label = StatusLabel::running();
        self.watcher.add(name.to_string(), record.process.clone()).await;
        Ok(())
    }

    /// Stops `name`. If alive: cancels the Watcher's observation, sends
    /// SIGTERM, then releases the registry lock while waiting for the child
    /// to actually finish, so the happens-after-exit guarantee doesn't hold
    /// up every other operation.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let record = registry
            .get(name)
            .ok_or_else(|| SupervisorError::Unknown { name: name.to_string() })?;

        if !record.process.is_alive() {
            if let Some(record) = registry.get_mut(name) {
                record.runtime.pid = None;
                record.runtime.status_label = StatusLabel::stopped();
            }
            return Ok(());
        }

        let process = record.process.clone();
        let done_rx = self.watcher.stop(name).await;
        if let Some(record) = registry.get_mut(name) {
            record.runtime.status_label = StatusLabel::asked_to_stop();
        }
        process.graceful_stop()?;

        drop(registry);
        if let Some(done_rx) = done_rx {
            let _ = done_rx.await;
        }

        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.get_mut(name) {
            record.runtime.pid = None;
            record.runtime.status_label = StatusLabel::stopped();
        }
        Ok(())
    }

    /// Stop then Start.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Stops `name`, removes it from the registry, deletes its artifacts,
    /// and persists the smaller process set.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.stop(name).await?;

        let record = {
            let mut registry = self.registry.lock().await;
            registry.remove(name)
        };
        let Some(record) = record else {
            return Ok(());
        };

        record.process.delete(&record.spec).await?;
        self.save().await
    }

    /// Snapshot of every registered process.
    pub async fn list(&self) -> Vec<ProcessStatus> {
        let registry = self.registry.lock().await;
        registry
            .values()
            .map(|record| ProcessStatus {
                name: record.spec.name.clone(),
                pid: record.runtime.pid,
                status_label: record.runtime.status_label.clone(),
                keep_alive: record.spec.keep_alive,
                restart_count: record.runtime.restart_count,
            })
            .collect()
    }

    /// Writes the full registry to the config file. Also invoked on every
    /// mutation that changes the process *set*
    /// (`prepare_and_run`, `delete`) and on the periodic save loop; plain
    /// Start/Stop/Restart only touch runtime fields that the config file
    /// carries informationally, so they don't trigger an extra write.
    pub async fn save(&self) -> Result<()> {
        let registry = self.registry.lock().await;
        let procs = registry
            .iter()
            .map(|(name, record)| {
                (
                    name.clone(),
                    ConfigProcessEntry {
                        spec: record.spec.clone(),
                        pid: record.runtime.pid,
                        status_label: record.runtime.status_label.clone(),
                        restart_count: record.runtime.restart_count,
                    },
                )
            })
            .collect();
        drop(registry);

        let config = ConfigFile {
            sys_folder: self.sys_folder.clone(),
            pid_file: self.pid_file.clone(),
            out_file: self.out_file.clone(),
            err_file: self.err_file.clone(),
            procs,
        };
        ConfigStore::write(&config, &self.config_path)
    }

    /// Starts every `keep_alive` process that isn't already running. Used at
    /// startup and as an explicit control op. Each spawn acquires and
    /// releases the registry lock independently: a spawn failure here is
    /// logged and Revive continues, rather than holding the lock across the
    /// whole batch and risking a stall against the supervise loop.
    pub async fn revive(&self) {
        let names: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .filter(|(_, record)| record.spec.keep_alive)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in names {
            if let Err(error) = self.start(&name).await {
                warn!(%name, %error, "failed to revive process");
            }
        }
    }

    /// Best-effort stop of every registered process, then a final save.
    /// Called once from the daemon's shutdown path.
    pub async fn shutdown(&self) {
        let names: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.keys().cloned().collect()
        };
        for name in names {
            if let Err(error) = self.stop(&name).await {
                warn!(%name, %error, "failed to stop process during shutdown");
            }
        }
        if let Err(error) = self.save().await {
            warn!(%error, "final config save failed during shutdown");
        }
    }
}

/// The request/response boundary the wire codec is built against.
/// [`Supervisor`] is the only implementor.
#[async_trait::async_trait]
pub trait ControlApi: Send + Sync {
    async fn gobin(&self, source_path: PathBuf, name: String, keep_alive: bool, args: Vec<String>) -> Result<String>;
    async fn start_proc(&self, name: &str) -> Result<()>;
    async fn stop_proc(&self, name: &str) -> Result<()>;
    async fn restart_proc(&self, name: &str) -> Result<()>;
    async fn delete_proc(&self, name: &str) -> Result<()>;
    async fn monit(&self) -> Vec<ProcessStatus>;
    async fn save_proc(&self) -> Result<()>;
    async fn resurrect(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl ControlApi for Supervisor {
    async fn gobin(&self, source_path: PathBuf, name: String, keep_alive: bool, args: Vec<String>) -> Result<String> {
        self.prepare_and_run(source_path, name, keep_alive, args).await
    }

    async fn start_proc(&self, name: &str) -> Result<()> {
        self.start(name).await
    }

    async fn stop_proc(&self, name: &str) -> Result<()> {
        self.stop(name).await
    }

    async fn restart_proc(&self, name: &str) -> Result<()> {
        self.restart(name).await
    }

    async fn delete_proc(&self, name: &str) -> Result<()> {
        self.delete(name).await
    }

    async fn monit(&self) -> Vec<ProcessStatus> {
        self.list().await
    }

    async fn save_proc(&self) -> Result<()> {
        self.save().await
    }

    async fn resurrect(&self) -> Result<()> {
        self.revive().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeProcess;
    use crate::testing::StubPreparable;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn factory() -> ProcessFactory {
        let counter = Arc::new(AtomicU32::new(100));
        Arc::new(move || {
            let pid = counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(FakeProcess::new(pid)) as Arc<dyn SupervisedProcess>
        })
    }

    async fn new_supervisor(dir: &Path) -> Arc<Supervisor> {
        std::fs::write(dir.join("config.toml"), "").unwrap();
        Supervisor::init(
            dir.to_path_buf(),
            dir.join("main.pid"),
            dir.join("main.out"),
            dir.join("main.err"),
            Arc::new(StubPreparable::default()),
            factory(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn prepare_and_run_rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;

        supervisor
            .prepare_and_run(PathBuf::from("./src"), "a".to_string(), false, vec![])
            .await
            .unwrap();

        let err = supervisor
            .prepare_and_run(PathBuf::from("./src"), "a".to_string(), false, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        supervisor
            .prepare_and_run(PathBuf::from("./src"), "a".to_string(), false, vec![])
            .await
            .unwrap();

        supervisor.start("a").await.unwrap();
        let status = supervisor.list().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].restart_count, 0);
    }

    #[tokio::test]
    async fn stop_does_not_trigger_restart() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        supervisor
            .prepare_and_run(PathBuf::from("./src"), "a".to_string(), true, vec![])
            .await
            .unwrap();
        supervisor.spawn_background_tasks();

        supervisor.stop("a").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = supervisor.list().await;
        assert_eq!(status[0].restart_count, 0);
        assert!(status[0].pid.is_none());
    }

    #[tokio::test]
    async fn delete_removes_from_registry_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        supervisor
            .prepare_and_run(PathBuf::from("./src"), "a".to_string(), false, vec![])
            .await
            .unwrap();

        supervisor.delete("a").await.unwrap();
        assert!(supervisor.list().await.is_empty());

        let reloaded = ConfigStore::read_into(&dir.path().join("config.toml")).unwrap();
        assert!(!reloaded.procs.contains_key("a"));
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unknown { .. }));
    }
}
