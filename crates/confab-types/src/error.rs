use thiserror::Error;

/// Domain errors raised by the friendship engine and message store.
///
/// The REST layer translates these to protocol status codes and the gateway
/// reports them back on the offending connection; nothing here is fatal to
/// the process.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("friend request already handled")]
    AlreadyHandled,

    #[error("{0}")]
    InvalidOperation(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Unauthenticated,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Stable machine-readable code carried in REST error bodies and
    /// gateway `Error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::AlreadyHandled => "ALREADY_HANDLED",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Conflict(_) => "CONFLICT",
            Self::Validation(_) => "VALIDATION",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Internal(_) => "INTERNAL",
        }
    }
}
