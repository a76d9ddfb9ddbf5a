//! Crate-level convenience error: a thin wrapper over the per-module enums.

use thiserror::Error;

use crate::config::ConfigError;
use crate::karl::KarlError;
use crate::karl::nginx::NginxError;
use crate::store::StoreError;
use crate::stream::{PersistError, StreamError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Karl(#[from] KarlError),

    #[error(transparent)]
    Nginx(#[from] NginxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
