// Durable store adapters.
//
// The durable store is the authoritative, versioned copy of every document.
// The relay only needs three things from it: read the current content,
// commit new content, and report the revision that last touched a document.

mod git;
mod memory;

use async_trait::async_trait;
use docsync_common::{Author, DocumentKey, Revision};
use thiserror::Error;

pub use git::{CommandExecutor, CommandResult, GitStore, ProcessCommandExecutor};
pub use memory::{MemoryStore, StoredCommit};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("durable store unavailable: {0}")]
    Unavailable(String),

    #[error("document changed since revision {expected}")]
    StaleBase { expected: Revision, actual: Option<Revision> },

    #[error("durable store rejected content: {0}")]
    InvalidContent(String),
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Current content, or `None` when the document has never been committed.
    async fn read(&self, key: &DocumentKey) -> Result<Option<String>, StoreError>;

    /// Commit `content` as the new version of the document.
    ///
    /// With a `base`, the commit only succeeds while `base` is still the
    /// document's head revision; otherwise it fails with
    /// [`StoreError::StaleBase`].
    async fn commit(
        &self,
        key: &DocumentKey,
        content: &str,
        author: &Author,
        message: &str,
        base: Option<&Revision>,
    ) -> Result<Revision, StoreError>;

    /// Revision of the last commit that touched the document.
    async fn head_revision(&self, key: &DocumentKey) -> Result<Option<Revision>, StoreError>;
}
