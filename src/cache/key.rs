//! Key Codec
//!
//! Deterministic keys for the four lookup dimensions. Every key carries a
//! namespace prefix so entry keys and index keys can never collide.
//!
//! URL keys are a truncated SHA-256 fingerprint. Two URLs sharing a
//! fingerprint resolve to the same entry; at 64 bits this is negligible and
//! no collision chain is kept.

use sha2::{Digest, Sha256};

pub const ENTRY_PREFIX: &str = "doc";
pub const URL_PREFIX: &str = "url";
pub const NAME_PREFIX: &str = "name";
pub const PATH_PREFIX: &str = "path";

/// Secondary index namespaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Url,
    Name,
    Path,
}

impl IndexKind {
    pub const ALL: [IndexKind; 3] = [IndexKind::Url, IndexKind::Name, IndexKind::Path];
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKind::Url => write!(f, "url-index"),
            IndexKind::Name => write!(f, "name-index"),
            IndexKind::Path => write!(f, "path-index"),
        }
    }
}

/// Fingerprint width in bytes (16 hex characters)
const URL_FINGERPRINT_BYTES: usize = 8;

/// Canonical primary key: `doc:{project_id}:{id}`
pub fn primary_key(project_id: &str, id: u64) -> String {
    format!("{}:{}:{}", ENTRY_PREFIX, project_id, id)
}

/// Fixed-width fingerprint of the raw URL string
pub fn url_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!(
        "{}:{}",
        URL_PREFIX,
        hex::encode(&digest[..URL_FINGERPRINT_BYTES])
    )
}

/// Name key, insensitive to case and surrounding whitespace
pub fn name_key(project_id: &str, name: &str) -> String {
    format!("{}:{}:{}", NAME_PREFIX, project_id, normalize_name(name))
}

/// Path key; the method is uppercased, the path is used verbatim
pub fn path_key(project_id: &str, method: &str, path: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        PATH_PREFIX,
        project_id,
        method.trim().to_uppercase(),
        path
    )
}

pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Whether `key` is a primary key belonging to `project_id`
pub fn is_project_key(key: &str, project_id: &str) -> bool {
    key.strip_prefix(ENTRY_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .and_then(|rest| rest.strip_prefix(project_id))
        .and_then(|rest| rest.strip_prefix(':'))
        .map(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}
