use std::path::PathBuf;

use chrono::NaiveDate;

use crate::models::ParseEnumError;

#[derive(Debug, thiserror::Error)]
pub enum QualityError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid {field} value stored: '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
}

impl From<ParseEnumError> for QualityError {
    fn from(err: ParseEnumError) -> Self {
        QualityError::InvalidValue {
            field: err.kind,
            value: err.value,
        }
    }
}

pub type Result<T> = std::result::Result<T, QualityError>;
