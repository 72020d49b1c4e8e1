use thiserror::Error;

use crate::cache::{CacheBuildError, StoreError};
use crate::config::LoadError;
use crate::infra::error::InfraError;

/// Top-level failure of a binary command.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Cache(#[from] CacheBuildError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
