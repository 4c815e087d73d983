use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Covers malformed, tampered and expired tokens alike. Callers must not
    /// be able to tell which one it was.
    #[error("invalid token")]
    InvalidToken,

    #[error("admin access required")]
    Forbidden,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl Error {
    /// Whether retrying the same operation can succeed. Only persistence
    /// outages qualify; bad data stays bad.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
