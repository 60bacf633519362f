// Document path canonicalization: NFKC, unified separators, no traversal.

use unicode_normalization::UnicodeNormalization;

use super::KeyError;

/// Longest accepted path, counted in characters after normalization.
pub const MAX_PATH_CHARS: usize = 512;

/// Canonicalize a repository-relative document path.
///
/// Two spellings of the same file must map to the same cache entries and the
/// same lock, so every path goes through here before it becomes part of a
/// [`DocumentKey`](super::DocumentKey):
/// - NFKC normalization
/// - `\` becomes `/`, runs of `/` collapse, leading/trailing `/` are dropped
/// - `.` and `..` components, NUL bytes and whitespace-only components are rejected
pub fn normalize_document_path(raw: &str) -> Result<String, KeyError> {
    if raw.contains('\0') {
        return Err(KeyError::NulByte);
    }

    let unified: String = raw.nfkc().map(|ch| if ch == '\\' { '/' } else { ch }).collect();

    let mut segments = Vec::new();
    for segment in unified.split('/').filter(|segment| !segment.is_empty()) {
        match segment {
            "." | ".." => return Err(KeyError::Traversal(segment.to_string())),
            _ if segment.trim().is_empty() => return Err(KeyError::BlankSegment),
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return Err(KeyError::EmptyPath);
    }

    let joined = segments.join("/");
    if joined.chars().count() > MAX_PATH_CHARS {
        return Err(KeyError::PathTooLong);
    }

    Ok(joined)
}
