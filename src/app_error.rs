use thiserror::Error;

use crate::php_serialize::PhpError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("source db error: {0}")]
    Source(String),
    #[error("db error: {0}")]
    Db(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("malformed serialized data: {0}")]
    Serialized(#[from] PhpError),
    #[error("not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Whether the failure only concerns the record being processed.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            AppError::Serialized(_) | AppError::NotFound(_) | AppError::Validation(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        AppError::Db(value.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        AppError::Io(value.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(value: toml::de::Error) -> Self {
        AppError::Config(value.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(value: base64::DecodeError) -> Self {
        AppError::Source(format!("attachment payload is not valid base64: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;
    use crate::php_serialize::PhpError;

    #[test]
    fn serialized_errors_are_record_level() {
        let err: AppError = PhpError::UnexpectedEnd.into();
        assert!(err.is_record_level());
        assert!(err.to_string().starts_with("malformed serialized data"));
    }

    #[test]
    fn db_errors_halt_the_job() {
        let err = AppError::Db("disk full".to_string());
        assert!(!err.is_record_level());
    }
}
