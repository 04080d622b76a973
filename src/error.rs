//! Errors returned by the monitoring core to its callers.

use crate::db::{DbError, ValidationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("storage error: {0}")]
    Storage(DbError),
}

impl MonitorError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Convert a store error, naming the record a `NotFound` refers to.
    pub fn from_db(err: DbError, entity: &'static str, id: i64) -> Self {
        match err {
            DbError::NotFound => Self::not_found(entity, id),
            other => other.into(),
        }
    }
}

impl From<DbError> for MonitorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(e) => Self::Validation(e),
            DbError::NotFound => Self::NotFound {
                entity: "record",
                id: 0,
            },
            other => Self::Storage(other),
        }
    }
}
