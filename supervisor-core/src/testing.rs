//! Test doubles shared between unit tests and integration tests. Not gated
//! behind `#[cfg(test)]` so `tests/*.rs` (a separate crate) can use them too,
//! matching [`crate::process::testing`]'s own always-public style.

use crate::preparable::{BuildError, BuildResult, Preparable};
use async_trait::async_trait;
use std::path::Path;
use std::path::PathBuf;

/// A [`Preparable`] that never touches a real compiler: "builds" by handing
/// back a fixed executable path, so the Supervisor's tests don't depend on
/// a `go` toolchain being present.
pub struct StubPreparable {
    pub executable: PathBuf,
}

impl Default for StubPreparable {
    fn default() -> Self {
        StubPreparable {
            executable: PathBuf::from("/bin/true"),
        }
    }
}

#[async_trait]
impl Preparable for StubPreparable {
    async fn prepare(&self, _source_path: &Path, _name: &str, _sys_folder: &Path) -> Result<BuildResult, BuildError> {
        Ok(BuildResult {
            executable: self.executable.clone(),
            output: "stub build ok".to_string(),
        })
    }
}
