use http::StatusCode;
use thiserror::Error;

use crate::experiments::config::ExperimentError;

#[derive(Error, Debug)]
pub enum FunnelabError {
    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, FunnelabError>;

impl From<std::io::Error> for FunnelabError {
    fn from(e: std::io::Error) -> Self {
        FunnelabError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FunnelabError {
    fn from(e: serde_json::Error) -> Self {
        FunnelabError::Json(e.to_string())
    }
}

impl FunnelabError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FunnelabError::Experiment(e) => e.status_code(),
            FunnelabError::Config(_) | FunnelabError::Io(_) | FunnelabError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
