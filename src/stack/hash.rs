//! Call-path identity.
//!
//! A frame's identity is a digest over its whole root-to-frame ancestry, so
//! the same function name reached through different callers never collapses
//! into one node. The digest is chained: each frame hashes its parent's
//! identity together with its own name.

use sha2::{Digest, Sha256};

/// Parent hash used by root frames.
pub const ROOT_PARENT: u64 = 0;

const DOMAIN: &[u8] = b"flamestore-frame-v1:";

/// Returns the identity of `name` called from the frame identified by `parent`.
///
/// Never returns [`ROOT_PARENT`].
pub fn frame_hash(parent: u64, name: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(parent.to_le_bytes());
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    match u64::from_le_bytes(bytes) {
        ROOT_PARENT => 1,
        h => h,
    }
}

/// Returns the identity of the last frame in a root-first path.
///
/// An empty path hashes to [`ROOT_PARENT`].
pub fn path_hash<S: AsRef<str>>(path: &[S]) -> u64 {
    path.iter()
        .fold(ROOT_PARENT, |parent, name| frame_hash(parent, name.as_ref()))
}
