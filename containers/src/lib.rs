pub mod block;
pub mod checkpoint;
pub mod slot;
pub mod status;
pub mod types;

pub use block::{hash_tree_root, BeaconBlock, BeaconBlockBody, SignedBeaconBlock};
pub use checkpoint::Checkpoint;
pub use slot::{Epoch, Slot};
pub use status::Status;
pub use types::{Bytes32, Signature, ValidatorIndex};
