use hearth_db::StoreError;
use hearth_types::api::ErrorKind;
use hearth_types::models::ContentError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// The backend refused the operation. Retrying the same call will not help.
    #[error("rejected ({kind:?}): {message}")]
    Rejected { kind: ErrorKind, message: String },

    /// The request may not have reached the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// The realtime feed ended.
    #[error("feed closed")]
    Closed,
}

impl SyncError {
    pub fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(detail) => Self::Transport(detail),
            e => Self::rejected(e.kind(), e.to_string()),
        }
    }
}

impl From<ContentError> for SyncError {
    fn from(e: ContentError) -> Self {
        Self::rejected(ErrorKind::Validation, e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
