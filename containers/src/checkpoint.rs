use crate::{Bytes32, Epoch};
use serde::{Deserialize, Serialize};

/// An epoch boundary together with the root of the block at that boundary.
///
/// Once finalized, a checkpoint is never reverted. Sync uses it as the floor
/// below which blocks are considered already processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Bytes32,
}

impl Checkpoint {
    pub fn new(epoch: Epoch, root: Bytes32) -> Self {
        Self { epoch, root }
    }
}
