//! SHA-256 digests used for change fingerprints and config hashes.

use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 digest of a string
pub fn compute_checksum(s: &str) -> String {
    compute_checksum_parts(std::iter::once(s))
}

/// Hash a sequence of parts without concatenating them first.
///
/// Each part is followed by a record separator (0x1e) so `["ab", "c"]` and
/// `["a", "bc"]` produce different digests.
pub fn compute_checksum_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1e]);
    }
    format!("{:x}", hasher.finalize())
}
