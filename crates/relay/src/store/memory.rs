// In-process durable store for tests and database-less development runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use docsync_common::{Author, DocumentKey, Revision};

use super::{DurableStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCommit {
    pub revision: Revision,
    pub content: String,
    pub author: Author,
    pub message: String,
}

#[derive(Debug, Default)]
struct State {
    history: HashMap<DocumentKey, Vec<StoredCommit>>,
    next_revision: u64,
    unavailable: bool,
}

impl State {
    fn head(&self, key: &DocumentKey) -> Option<&StoredCommit> {
        self.history.get(key).and_then(|commits| commits.last())
    }

    fn append(&mut self, key: &DocumentKey, content: &str, author: &Author, message: &str) -> Revision {
        self.next_revision += 1;
        let revision = Revision::new(format!("mem-{:08}", self.next_revision));
        self.history.entry(key.clone()).or_default().push(StoredCommit {
            revision: revision.clone(),
            content: content.to_string(),
            author: author.clone(),
            message: message.to_string(),
        });
        revision
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit made by something other than the relay, such as a git push.
    pub fn external_commit(&self, key: &DocumentKey, content: &str) -> Revision {
        self.state().append(key, content, &Author::new("external", "external@localhost"), "External edit")
    }

    pub fn commits(&self, key: &DocumentKey) -> Vec<StoredCommit> {
        self.state().history.get(key).cloned().unwrap_or_default()
    }

    pub fn commit_count(&self, key: &DocumentKey) -> usize {
        self.state().history.get(key).map_or(0, Vec::len)
    }

    /// Simulate an outage: every operation fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let state = self.state();
        state.ensure_available()?;
        Ok(state.head(key).map(|commit| commit.content.clone()))
    }

    async fn commit(
        &self,
        key: &DocumentKey,
        content: &str,
        author: &Author,
        message: &str,
        base: Option<&Revision>,
    ) -> Result<Revision, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;

        if let Some(expected) = base {
            let actual = state.head(key).map(|commit| commit.revision.clone());
            if actual.as_ref() != Some(expected) {
                return Err(StoreError::StaleBase { expected: expected.clone(), actual });
            }
        }

        Ok(state.append(key, content, author, message))
    }

    async fn head_revision(&self, key: &DocumentKey) -> Result<Option<Revision>, StoreError> {
        let state = self.state();
        state.ensure_available()?;
        Ok(state.head(key).map(|commit| commit.revision.clone()))
    }
}
