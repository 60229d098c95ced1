//! Facade errors.

use stamps_cache::CacheError;
use stamps_db::DbError;

/// Failure bringing the data-access layer up.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
