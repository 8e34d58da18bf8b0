use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BatchError {
    #[error("config file not found: {0}")]
    #[diagnostic(help("pass --config <path> or create the file next to the working directory"))]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("API_KEY not found in environment or .env file")]
    MissingCredentials,

    #[error("no input to process: {0}")]
    EmptyInput(String),

    #[error("upload of {path} failed: {message}")]
    Upload { path: PathBuf, message: String },

    #[error("request failed: {0}")]
    Http(String),

    #[error("service returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response from service: {0}")]
    Decode(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BatchError {
    /// Configuration problems abort a run before any remote call is made.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            BatchError::MissingConfig(_)
                | BatchError::ConfigRead(_)
                | BatchError::ConfigParse(_)
                | BatchError::InvalidConfig(_)
                | BatchError::MissingCredentials
                | BatchError::EmptyInput(_)
        )
    }
}
