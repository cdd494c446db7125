use crate::{Bytes32, Signature, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};
use ssz::SszHash;
use ssz_derive::Ssz;

/// Payload of a block. Sync treats it as opaque apart from its root.
#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
pub struct BeaconBlockBody {
    pub graffiti: Bytes32,
    pub execution_payload_hash: Bytes32,
}

#[derive(Clone, Debug, PartialEq, Eq, Ssz, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Bytes32,
    pub state_root: Bytes32,
    pub body: BeaconBlockBody,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: Signature,
}

impl SignedBeaconBlock {
    pub fn slot(&self) -> Slot {
        self.message.slot
    }

    pub fn parent_root(&self) -> Bytes32 {
        self.message.parent_root
    }

    /// Root of the inner block; the signature does not contribute.
    pub fn root(&self) -> Bytes32 {
        hash_tree_root(&self.message)
    }
}

/// Compute the SSZ hash tree root for any type implementing `SszHash`.
pub fn hash_tree_root<T: SszHash>(value: &T) -> Bytes32 {
    Bytes32(value.hash_tree_root())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::{assert_eq, assert_ne};

    fn block(slot: u64, parent_root: Bytes32) -> BeaconBlock {
        BeaconBlock {
            slot: Slot(slot),
            parent_root,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_body_root() {
        // Two zero chunks hash to the depth one zero hash.
        let expected: Bytes32 = "f5a5fd42d16a20302798ef6ed309979b43003d2320d9f0e8ea9831a92759fb4b"
            .parse()
            .unwrap();
        assert_eq!(hash_tree_root(&BeaconBlockBody::default()), expected);
    }

    #[test]
    fn test_root_is_deterministic() {
        let a = block(7, Bytes32::from([1; 32]));
        assert_eq!(hash_tree_root(&a), hash_tree_root(&a.clone()));
    }

    #[test]
    fn test_root_depends_on_every_header_field() {
        let base = block(7, Bytes32::from([1; 32]));
        let root = hash_tree_root(&base);

        assert_ne!(root, hash_tree_root(&block(8, Bytes32::from([1; 32]))));
        assert_ne!(root, hash_tree_root(&block(7, Bytes32::from([2; 32]))));

        let mut other = base.clone();
        other.proposer_index = ValidatorIndex(3);
        assert_ne!(root, hash_tree_root(&other));

        let mut other = base.clone();
        other.body.graffiti = Bytes32::from([9; 32]);
        assert_ne!(root, hash_tree_root(&other));
    }

    #[test]
    fn test_signature_does_not_change_root() {
        let message = block(1, Bytes32::ZERO);
        let unsigned = SignedBeaconBlock { message: message.clone(), signature: Signature::default() };
        let signed = SignedBeaconBlock { message, signature: Signature(vec![0xaa; 96]) };
        assert_eq!(unsigned.root(), signed.root());
    }

    #[test]
    fn test_json_uses_camel_case_fields() {
        let json = serde_json::to_value(block(3, Bytes32::ZERO)).unwrap();
        assert!(json.get("parentRoot").is_some());
        assert!(json.get("proposerIndex").is_some());
    }
}
