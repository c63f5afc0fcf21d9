use axum::http::StatusCode;

/// Failures a chat operation can report back to the connection that caused it.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not a member of this group")]
    Forbidden,

    #[error("admin role required")]
    AdminOnly,

    #[error("{0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("not joined to group {0}")]
    NotJoined(i64),

    #[error("internal error: {0}")]
    Internal(#[from] tokio::task::JoinError),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden | ChatError::AdminOnly => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotJoined(_) => StatusCode::CONFLICT,
            ChatError::Storage(_) | ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text sent to the client in an `error` event.
    ///
    /// Storage failures are reported without the driver detail.
    pub fn client_message(&self) -> String {
        match self {
            ChatError::Storage(_) => "storage unavailable".to_owned(),
            ChatError::Internal(_) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}
