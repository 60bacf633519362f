// Document identity: one collaborative document per (project, path).

mod normalize;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use normalize::{normalize_document_path, MAX_PATH_CHARS};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("document path is empty")]
    EmptyPath,

    #[error("document path exceeds {MAX_PATH_CHARS} characters")]
    PathTooLong,

    #[error("document path contains traversal component `{0}`")]
    Traversal(String),

    #[error("document path contains a NUL byte")]
    NulByte,

    #[error("document path contains a whitespace-only component")]
    BlankSegment,

    #[error("malformed document key `{0}`")]
    Malformed(String),
}

/// Identifies one collaborative document.
///
/// The path is always stored in normalized form, so equality on keys is
/// equality on documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentKey {
    project_id: Uuid,
    path: String,
}

impl DocumentKey {
    pub fn new(project_id: Uuid, raw_path: &str) -> Result<Self, KeyError> {
        Ok(Self { project_id, path: normalize_document_path(raw_path)? })
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Broadcast topic shared by every subscriber of this document.
    pub fn topic(&self) -> String {
        format!("document:{}:{}", self.project_id, self.path)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.path)
    }
}

impl FromStr for DocumentKey {
    type Err = KeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (project, path) =
            raw.split_once(':').ok_or_else(|| KeyError::Malformed(raw.to_string()))?;
        let project_id =
            Uuid::parse_str(project).map_err(|_| KeyError::Malformed(raw.to_string()))?;
        Self::new(project_id, path)
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = KeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_spellings_share_a_key() {
        let project = Uuid::new_v4();
        let a = DocumentKey::new(project, "/docs//paper.tex").unwrap();
        let b = DocumentKey::new(project, "docs\\paper.tex").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.path(), "docs/paper.tex");
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let key = DocumentKey::new(Uuid::new_v4(), "notes/a:b.md").unwrap();
        let parsed: DocumentKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn from_str_rejects_garbage() {
        assert!(matches!("no-colon".parse::<DocumentKey>(), Err(KeyError::Malformed(_))));
        assert!(matches!("not-a-uuid:a.md".parse::<DocumentKey>(), Err(KeyError::Malformed(_))));
    }

    #[test]
    fn topic_is_namespaced_by_project_and_path() {
        let project = Uuid::new_v4();
        let key = DocumentKey::new(project, "main.tex").unwrap();
        assert_eq!(key.topic(), format!("document:{project}:main.tex"));
    }

    #[test]
    fn serializes_as_display_string() {
        let key = DocumentKey::new(Uuid::new_v4(), "a.md").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{key}\""));
        let back: DocumentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
