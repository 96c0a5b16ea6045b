use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum ScriptsError {
    #[error("scripts path is not configured (MODHOST_SCRIPTS_PATH)")]
    ScriptsPathMissing,

    #[error("worker '{name}' is already running")]
    WorkerExists { name: String },

    #[error("worker '{name}' not found")]
    WorkerNotFound { name: String },

    #[error("failed to spawn worker '{name}' from {}", path.display())]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor task of worker '{name}' failed")]
    Join {
        name: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl ScriptsError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            ScriptsError::ScriptsPathMissing => "scripts_path_missing",
            ScriptsError::WorkerExists { .. } => "worker_exists",
            ScriptsError::WorkerNotFound { .. } => "worker_not_found",
            ScriptsError::Spawn { .. } => "spawn_failed",
            ScriptsError::Join { .. } => "supervisor_failed",
            ScriptsError::ShuttingDown => "shutting_down",
        }
    }
}
