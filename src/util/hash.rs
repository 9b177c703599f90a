use sha2::{Digest, Sha256};

/// Stable identifier for a crawled document, derived from its detail URL.
///
/// The URL alone goes into the digest so the id survives title edits and
/// content revisions of the same page.
pub fn document_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
