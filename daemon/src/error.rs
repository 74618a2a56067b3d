use std::path::PathBuf;
use thiserror::Error;

/// A supervised command could not be started or ended abnormally.
///
/// Always recovered by the owning runner: logged, then restarted.
#[derive(Error, Debug)]
pub enum LaunchFailure {
    #[error("{service}: failed to spawn: {source}")]
    Spawn {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service}: exited abnormally ({status})")]
    AbnormalExit {
        service: String,
        status: std::process::ExitStatus,
        output: Vec<String>,
    },

    #[error("{service}: lost track of child: {source}")]
    Wait {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchFailure {
    /// Tail of the child's captured stdout/stderr, if any.
    pub fn output(&self) -> &[String] {
        match self {
            LaunchFailure::AbnormalExit { output, .. } => output,
            LaunchFailure::Spawn { .. } | LaunchFailure::Wait { .. } => &[],
        }
    }
}

/// Startup condition that must hold before any service is launched.
#[derive(Error, Debug)]
pub enum PrerequisiteMissing {
    #[error("job store {0:?} does not exist")]
    StoreAbsent(PathBuf),

    #[error("job store {path:?} is not initialized (schema version {found}, expected {expected})")]
    StoreNotInitialized {
        path: PathBuf,
        found: i32,
        expected: i32,
    },

    #[error("job store {path:?} cannot be read: {source}")]
    StoreUnreadable {
        path: PathBuf,
        #[source]
        source: common::StoreError,
    },

    #[error("required path {0:?} does not exist")]
    PathAbsent(PathBuf),
}
