//! Content hashing for COW objects: lowercase hex SHA-256.

use sha2::{Digest, Sha256};

pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Two-hex-digit shard prefix used for `_cow/{blobs,trees,commits}/<sha[0..2]>/<sha>`.
pub fn shard_prefix(hash: &str) -> &str {
    &hash[..2.min(hash.len())]
}
