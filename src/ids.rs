//! Content-derived identifiers

use sha2::{Digest, Sha256};

/// Hex characters kept from the digest
const ID_HEX_LEN: usize = 24;

/// Stable id from `parts`: `<prefix>_<first 24 hex chars of sha256>`.
/// Parts are NUL-separated so ("ab", "c") and ("a", "bc") differ.
pub fn content_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}", prefix, &digest[..ID_HEX_LEN])
}
