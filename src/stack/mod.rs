pub mod decode;
pub mod hash;
pub mod normalize;

use std::collections::HashMap;
use std::sync::Arc;

/// One stack level after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: Arc<str>,
    /// Digest over the root-to-frame path.
    pub hash: u64,
    /// Hash of the calling frame, or [`hash::ROOT_PARENT`] for roots.
    pub parent_hash: u64,
}

/// Frame hash -> frame.
pub type FrameIndex = HashMap<u64, Frame>;

/// Frame hash -> accumulated sample count.
pub type WeightTable = HashMap<u64, u64>;
