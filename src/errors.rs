use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NETWORK_UNAVAILABLE: {0}")]
    NetworkUnavailable(String),
    #[error("RESOURCE_EXHAUSTED: {0}")]
    ResourceExhausted(String),
    #[error("CONNECTION_ERROR: {0}")]
    Connection(String),
    #[error("REMOTE_REJECTED: {0}")]
    RemoteRejected(String),
    #[error("STORAGE_QUOTA_EXCEEDED: {0}")]
    StorageQuotaExceeded(String),
    #[error("STORAGE_FAILURE: {0}")]
    Storage(String),
    #[error("SERIALIZATION: {0}")]
    Serialization(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable(_) => "NETWORK_UNAVAILABLE",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::RemoteRejected(_) => "REMOTE_REJECTED",
            Self::StorageQuotaExceeded(_) => "STORAGE_QUOTA_EXCEEDED",
            Self::Storage(_) => "STORAGE_FAILURE",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Config(_) => "CONFIG_INVALID",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<crate::remote::RemoteError> for AppError {
    fn from(value: crate::remote::RemoteError) -> Self {
        use crate::remote::RemoteErrorKind;
        let message = value.to_string();
        match value.kind {
            RemoteErrorKind::NetworkUnavailable => Self::NetworkUnavailable(message),
            RemoteErrorKind::ResourceExhausted => Self::ResourceExhausted(message),
            RemoteErrorKind::ConnectionError => Self::Connection(message),
            RemoteErrorKind::RemoteRejected => Self::RemoteRejected(message),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use crate::remote::{RemoteError, RemoteErrorKind};

    #[test]
    fn display_is_prefixed_with_code() {
        let error = AppError::StorageQuotaExceeded("key=devices".to_string());
        assert_eq!(error.code(), "STORAGE_QUOTA_EXCEEDED");
        assert!(error.to_string().starts_with("STORAGE_QUOTA_EXCEEDED: "));
    }

    #[test]
    fn remote_error_keeps_its_category() {
        let remote = RemoteError::new(RemoteErrorKind::RemoteRejected, "duplicate device name").with_status(409);
        let error = AppError::from(remote);
        assert_eq!(error.code(), "REMOTE_REJECTED");
        assert!(error.to_string().contains("duplicate device name"));
    }
}
