use thiserror::Error;

pub type TlfKeysResult<T> = Result<T, TlfKeysError>;

#[derive(Debug, Error)]
pub enum TlfKeysError {
    #[error("invalid ephemeral key index {index}: {detail}")]
    InvalidIndex { index: i64, detail: String },

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("crypto failure: {0:#}")]
    Crypto(anyhow::Error),

    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid successor: {0}")]
    Successor(String),

    #[error("authorization failure: {0}")]
    Authorization(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TlfKeysError {
    pub fn index_out_of_range(index: impl Into<i64>, count: usize) -> Self {
        Self::InvalidIndex {
            index: index.into(),
            detail: format!("bundle has {count} ephemeral keys"),
        }
    }

    pub fn negative_index(index: impl Into<i64>) -> Self {
        Self::InvalidIndex {
            index: index.into(),
            detail: "index is negative".into(),
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn successor(msg: impl Into<String>) -> Self {
        Self::Successor(msg.into())
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }
}
