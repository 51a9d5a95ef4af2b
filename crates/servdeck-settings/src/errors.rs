use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server definition: {0}")]
    InvalidServer(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
