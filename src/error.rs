use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("{0}")]
    Validation(String),

    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("No user interests set")]
    NoInterests,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Question not found: {0}")]
    QuestionNotFound(i64),

    #[error("Question {0} is already resolved")]
    AlreadyResolved(i64),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PredictError {
    pub fn internal(message: impl Into<String>) -> Self {
        PredictError::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PredictError>;
