use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One document returned by a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub body: Vec<u8>,
}

/// Hierarchical document store holding every identity's replica.
///
/// Paths look like `users/{key}/daily_logs/{day}`. Document ids within a
/// collection are ordered lexicographically, and range queries include
/// both bounds. Timeout policy belongs to the implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether any document lives under `namespace`.
    async fn exists(&self, namespace: &str) -> Result<bool, RemoteError>;

    async fn get_document(&self, path: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn set_document(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError>;

    async fn range_query(
        &self,
        collection: &str,
        start: &str,
        end: &str,
    ) -> Result<Vec<RemoteDocument>, RemoteError>;
}
