use hex::FromHex;
use serde::{Deserialize, Serialize};
use ssz::H256;
use ssz_derive::Ssz;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Ssz, Default, Serialize, Deserialize)]
#[ssz(transparent)]
pub struct Bytes32(pub H256);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ssz, Default, Serialize, Deserialize)]
#[ssz(transparent)]
pub struct ValidatorIndex(pub u64);

/// Opaque signature bytes. Verification happens outside of sync.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32(H256([0; 32]));

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Bytes32(H256(bytes))
    }
}

impl FromStr for Bytes32 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s)?;
        Ok(Bytes32::from(bytes))
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.as_bytes()))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "0x{}…", hex::encode(&self.as_bytes()[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bytes32_hex_roundtrip() {
        let root = Bytes32::from([0xab; 32]);
        let parsed: Bytes32 = root.to_string().parse().unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_bytes32_parse_without_prefix() {
        let hex = "11".repeat(32);
        let parsed: Bytes32 = hex.parse().unwrap();
        assert_eq!(parsed, Bytes32::from([0x11; 32]));
    }

    #[test]
    fn test_bytes32_rejects_short_input() {
        assert!("0x1234".parse::<Bytes32>().is_err());
    }

    #[test]
    fn test_zero() {
        assert!(Bytes32::ZERO.is_zero());
        assert!(!Bytes32::from([1; 32]).is_zero());
    }
}
