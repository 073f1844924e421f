//! The externalized build step behind `PrepareAndRun`.
//!
//! The core only requires something that turns a source directory into an
//! executable path plus a build log; [`GoBuildPreparable`] is one concrete
//! collaborator, kept outside the supervision core proper.

use std::path::{Path, PathBuf};

/// What a successful build produced.
pub struct BuildResult {
    pub executable: PathBuf,
    pub output: String,
}

/// What a failed build produced: combined stdout+stderr, for the caller to
/// surface as `SupervisorError::BuildFailed`.
pub struct BuildError {
    pub output: String,
}

/// A pluggable build step. The supervision core depends only on this trait,
/// never on a specific toolchain.
#[async_trait::async_trait]
pub trait Preparable: Send + Sync {
    async fn prepare(&self, source_path: &Path, name: &str, sys_folder: &Path) -> Result<BuildResult, BuildError>;
}

/// Builds a Go package directory into `<sys_folder>/<name>/<name>` via `go
/// build`. Normalizes a single trailing slash on `source_path` before
/// deriving paths from it.
pub struct GoBuildPreparable {
    pub go_binary: PathBuf,
}

impl Default for GoBuildPreparable {
    fn default() -> Self {
        GoBuildPreparable {
            go_binary: PathBuf::from("go"),
        }
    }
}

impl GoBuildPreparable {
    fn binary_path(sys_folder: &Path, name: &str) -> PathBuf {
        sys_folder.join(name).join(name)
    }

    fn normalize_source_path(source_path: &Path) -> PathBuf {
        let s = source_path.to_string_lossy();
        match s.strip_suffix('/') {
            Some(trimmed) => PathBuf::from(trimmed),
            None => source_path.to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Preparable for GoBuildPreparable {
    async fn prepare(&self, source_path: &Path, name: &str, sys_folder: &Path) -> Result<BuildResult, BuildError> {
        let source_path = Self::normalize_source_path(source_path);
        let executable = Self::binary_path(sys_folder, name);

        if let Some(parent) = executable.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let output = tokio::process::Command::new(&self.go_binary)
            .arg("build")
            .arg("-o")
            .arg(&executable)
            .arg(source_path.join("."))
            .output()
            .await
            .map_err(|e| BuildError {
                output: format!("failed to invoke {}: {e}", self.go_binary.display()),
            })?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        if output.status.success() {
            Ok(BuildResult {
                executable,
                output: combined,
            })
        } else {
            Err(BuildError { output: combined })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_single_trailing_slash() {
        assert_eq!(
            GoBuildPreparable::normalize_source_path(Path::new("./sleeper/")),
            PathBuf::from("./sleeper")
        );
        assert_eq!(
            GoBuildPreparable::normalize_source_path(Path::new("./sleeper")),
            PathBuf::from("./sleeper")
        );
    }

    #[test]
    fn binary_path_is_name_inside_sys_folder_name_dir() {
        assert_eq!(
            GoBuildPreparable::binary_path(Path::new("/tmp/s"), "a"),
            PathBuf::from("/tmp/s/a/a")
        );
    }
}
