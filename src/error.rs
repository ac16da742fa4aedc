use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("No network connection available")]
    NoConnectivity,

    #[error("No network connection or cached copy available for {0}")]
    NoCachedCopy(String),

    #[error("Download error: {0}")]
    Transport(String),

    #[error("Malformed content: {0}")]
    Decode(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(#[source] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Errors after which a cached copy may stand in for the network.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            AppError::NoConnectivity | AppError::Transport(_) | AppError::Http(_)
        )
    }
}
