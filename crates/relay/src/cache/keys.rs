// The only place cache keys are spelled out.

use docsync_common::DocumentKey;

/// Registry of every document ever materialized into the cache.
pub const KNOWN_DOCUMENTS: &str = "all_ydoc_keys";

/// Per-document entry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Serialized CRDT state.
    State,
    /// Number of live editor connections.
    ActiveCount,
    /// Unix millis of the last accepted update.
    LastEditAt,
    /// Durable revision the cached state was derived from.
    OriginHead,
    /// Revision produced by our own most recent flush.
    FlushHead,
    /// Last external revision already announced to editors.
    InvalidatedHead,
}

impl EntryKind {
    const fn prefix(self) -> &'static str {
        match self {
            Self::State => "ydoc",
            Self::ActiveCount => "ydoc_active_count",
            Self::LastEditAt => "ydoc_last_edit_at",
            Self::OriginHead => "ydoc_git_head",
            Self::FlushHead => "last_flush_head",
            Self::InvalidatedHead => "ydoc_invalidated_head",
        }
    }
}

pub fn entry(kind: EntryKind, key: &DocumentKey) -> String {
    format!("{}:{key}", kind.prefix())
}
