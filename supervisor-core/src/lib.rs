//! Supervision core for a local process-supervisor daemon: a registry of
//! declared processes, a file-backed config store, a Watcher that turns
//! child exits into restart decisions, and the Supervisor that ties them
//! together behind a small set of control operations.

pub mod config;
pub mod error;
pub mod file_mutex;
pub mod preparable;
pub mod process;
pub mod supervisor;
pub mod testing;
pub mod watcher;

pub use config::{ConfigFile, ConfigProcessEntry, ConfigStore};
pub use error::{Result, SupervisorError};
pub use file_mutex::{FileMutex, FileMutexGuard};
pub use preparable::{BuildError, BuildResult, GoBuildPreparable, Preparable};
pub use process::{ExitOutcome, NativeProcess, ProcessRuntime, ProcessSpec, StatusLabel, SupervisedProcess};
pub use supervisor::{ControlApi, ProcessFactory, ProcessRecord, ProcessStatus, Supervisor};
pub use watcher::{RestartSignal, Watcher};
