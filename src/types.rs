//! Shared identifier types.

use rand::Rng as _;
use std::fmt;

/// 160-bit identifier of a distribution unit.
///
/// The same keyspace is shared between the swarm protocol, the tracker and
/// the DHT, so everything that names content passes one of these around.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn generate() -> Self {
        let mut hash = [0u8; 20];
        rand::rng().fill(&mut hash);
        Self(hash)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Some(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = InfoHash::generate();
        let parsed = InfoHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(InfoHash::from_bytes(&[0u8; 19]).is_none());
        assert!(InfoHash::from_bytes(&[0u8; 21]).is_none());
        assert!(InfoHash::from_bytes(&[0u8; 20]).is_some());
    }
}
