// CRDT engine: thin wrapper over yrs.
//
// Documents are a single Y.Text named `content`. State is always exchanged as
// a full v1 update encoded against the empty state vector, never a diff log.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

const TEXT_ROOT: &str = "content";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),

    #[error("failed to apply CRDT update: {0}")]
    Apply(String),
}

/// Fresh state seeded with `text`.
pub fn init(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    if !text.is_empty() {
        let root = doc.get_or_insert_text(TEXT_ROOT);
        let mut txn = doc.transact_mut();
        root.insert(&mut txn, 0, text);
    }
    encode(&doc)
}

/// Merge `update` into `state` (absent state merges into an empty document).
pub fn merge(state: Option<&[u8]>, update: &[u8]) -> Result<Vec<u8>, EngineError> {
    let doc = Doc::new();
    if let Some(state) = state {
        apply(&doc, state)?;
    }
    apply(&doc, update)?;
    Ok(encode(&doc))
}

/// Plain text content of `state`.
pub fn materialize(state: &[u8]) -> Result<String, EngineError> {
    let doc = Doc::new();
    apply(&doc, state)?;
    let root = doc.get_or_insert_text(TEXT_ROOT);
    let txn = doc.transact();
    Ok(root.get_string(&txn))
}

fn apply(doc: &Doc, payload: &[u8]) -> Result<(), EngineError> {
    let update = Update::decode_v1(payload).map_err(|e| EngineError::Decode(e.to_string()))?;
    doc.transact_mut().apply_update(update).map_err(|e| EngineError::Apply(e.to_string()))
}

fn encode(doc: &Doc) -> Vec<u8> {
    doc.transact().encode_state_as_update_v1(&StateVector::default())
}


#[cfg(test)]
mod tests {
    use super::testing::edit;
    use super::*;

    #[test]
    fn init_round_trips_text() {
        assert_eq!(materialize(&init("# Hello")).unwrap(), "# Hello");
    }

    #[test]
    fn empty_init_materializes_empty() {
        assert_eq!(materialize(&init("")).unwrap(), "");
    }

    #[test]
    fn merge_applies_update_on_top_of_state() {
        let base = init("hello");
        let update = edit(&base, 11, 5, " world");
        let merged = merge(Some(&base), &update).unwrap();
        assert_eq!(materialize(&merged).unwrap(), "hello world");
    }

    #[test]
    fn merge_without_state_starts_from_empty_document() {
        let update = edit(&init(""), 3, 0, "abc");
        let merged = merge(None, &update).unwrap();
        assert_eq!(materialize(&merged).unwrap(), "abc");
    }

    #[test]
    fn concurrent_edits_converge_regardless_of_order() {
        let base = init("ab");
        let left = edit(&base, 21, 0, "X");
        let right = edit(&base, 22, 2, "Y");

        let lr = merge(Some(&merge(Some(&base), &left).unwrap()), &right).unwrap();
        let rl = merge(Some(&merge(Some(&base), &right).unwrap()), &left).unwrap();

        assert_eq!(materialize(&lr).unwrap(), "XabY");
        assert_eq!(materialize(&lr).unwrap(), materialize(&rl).unwrap());
    }

    #[test]
    fn merging_the_same_update_twice_is_idempotent() {
        let base = init("a");
        let update = edit(&base, 5, 1, "b");
        let once = merge(Some(&base), &update).unwrap();
        let twice = merge(Some(&once), &update).unwrap();
        assert_eq!(materialize(&twice).unwrap(), "ab");
    }

    #[test]
    fn garbage_update_is_rejected() {
        let base = init("a");
        assert!(merge(Some(&base), b"definitely-not-yjs").is_err());
    }
}
