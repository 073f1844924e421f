//! Durable snapshot of the registry as a human-editable TOML file.

use crate::error::{Result, SupervisorError};
use crate::file_mutex::FileMutex;
use crate::process::{ProcessSpec, StatusLabel};
use std::collections::HashMap;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// The on-disk layout of the whole registry.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ConfigFile {
    pub sys_folder: PathBuf,
    pub pid_file: PathBuf,
    pub out_file: PathBuf,
    pub err_file: PathBuf,
    #[serde(default)]
    pub procs: HashMap<String, ConfigProcessEntry>,
}

/// A `ProcessSpec` plus the runtime fields persisted for operator
/// inspection; never treated as authoritative on reload.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ConfigProcessEntry {
    #[serde(flatten)]
    pub spec: ProcessSpec,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub status_label: StatusLabel,
    #[serde(default)]
    pub restart_count: u64,
}

/// Durable snapshot/reload of a [`ConfigFile`], guarded by a [`FileMutex`]
/// on the same path.
pub struct ConfigStore;

impl ConfigStore {
    /// Reads and decodes `path`. Missing or unreadable files are fatal:
    /// the operator must provide at least an empty TOML file.
    pub fn read_into(path: &Path) -> Result<ConfigFile> {
        if std::fs::metadata(path).is_err() {
            return Err(SupervisorError::FatalStartup(format!(
                "{}: config file missing (create an empty file to start fresh)",
                path.display()
            )));
        }

        let mutex = FileMutex::new(path)?;
        let _guard = mutex.lock()?;

        let text = std::fs::read_to_string(path).map_err(|source| SupervisorError::FatalStartup(format!(
            "{}: unreadable ({source})",
            path.display()
        )))?;

        toml::from_str(&text).map_err(|source| {
            SupervisorError::FatalStartup(format!("{}: invalid config ({source})", path.display()))
        })
    }

    /// Encodes `source` and atomically overwrites `path`, truncate+create,
    /// mode 0777.
    pub fn write(source: &ConfigFile, path: &Path) -> Result<()> {
        let mutex = FileMutex::new(path)?;
        let _guard = mutex.lock()?;

        let text = toml::to_string_pretty(source).map_err(|source| SupervisorError::IoFailed {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
        })?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o777)
            .open(path)
            .map_err(|source| SupervisorError::IoFailed {
                path: path.to_path_buf(),
                source,
            })?;

        file.write_all(text.as_bytes()).map_err(|source| SupervisorError::IoFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_specs() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "").unwrap();

        let mut procs = HashMap::new();
        let spec = ProcessSpec::new(dir.path(), "a", PathBuf::from("/bin/true"), vec!["x".into()]);
        procs.insert(
            "a".to_string(),
            ConfigProcessEntry {
                spec: spec.clone(),
                pid: Some(123),
                status_label: StatusLabel::running(),
                restart_count: 2,
            },
        );
        let config = ConfigFile {
            sys_folder: dir.path().to_path_buf(),
            pid_file: dir.path().join("main.pid"),
            out_file: dir.path().join("main.out"),
            err_file: dir.path().join("main.err"),
            procs,
        };

        ConfigStore::write(&config, &config_path).unwrap();
        let reloaded = ConfigStore::read_into(&config_path).unwrap();

        assert_eq!(reloaded.procs["a"].spec, spec);
        assert_eq!(reloaded.sys_folder, config.sys_folder);
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("nonexistent.toml");
        let err = ConfigStore::read_into(&config_path).unwrap_err();
        assert!(matches!(err, SupervisorError::FatalStartup(_)));
    }
}
