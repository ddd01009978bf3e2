use std::time::Duration;

/// Which external collaborator a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Embedding,
    Generation,
    Vision,
    Transport,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Embedding => "embedding",
            Backend::Generation => "generation",
            Backend::Vision => "vision",
            Backend::Transport => "transport",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("sender {0} is not approved")]
    AccessDenied(i64),

    #[error("reply target {reply_to_id} does not exist in conversation {conversation_id}")]
    IntegrityViolation { conversation_id: i64, reply_to_id: i64 },

    #[error("user {0} does not exist")]
    UnknownSender(i64),

    #[error("message {message_id} already stored in conversation {conversation_id}")]
    Duplicate { conversation_id: i64, message_id: i64 },

    #[error("message {message_id} not found in conversation {conversation_id}")]
    NotFound { conversation_id: i64, message_id: i64 },

    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{backend} backend timed out after {after:?}")]
    BackendTimeout { backend: Backend, after: Duration },

    #[error("{backend} backend unavailable: {source}")]
    BackendUnavailable {
        backend: Backend,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn unavailable(backend: Backend, source: anyhow::Error) -> Self {
        CoreError::BackendUnavailable { backend, source }
    }
}
