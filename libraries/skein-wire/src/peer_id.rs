use std::str::FromStr;

use thiserror::Error;

/// Multihash code for blake3-256.
const MH_BLAKE3: u8 = 0x1e;
const MH_DIGEST_LEN: u8 = 32;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("not valid base58")]
    Base58,
    #[error("multihash has the wrong code or length")]
    Multihash,
}

/// A peer identity: the multihash of the peer's canonical public key bytes.
/// Compared and hashed by raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 34]);

impl PeerId {
    /// Hashes canonical public key bytes down to a PeerID.
    pub fn from_key_bytes(key_bytes: &[u8]) -> Self {
        let digest = blake3::hash(key_bytes);
        let mut out = [0u8; 34];
        out[0] = MH_BLAKE3;
        out[1] = MH_DIGEST_LEN;
        out[2..].copy_from_slice(digest.as_bytes());
        Self(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let bytes: &[u8; 34] = bytes.try_into().map_err(|_| PeerIdError::Multihash)?;
        if bytes[0] != MH_BLAKE3 || bytes[1] != MH_DIGEST_LEN {
            return Err(PeerIdError::Multihash);
        }
        Ok(Self(*bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bs58::encode(&self.0).into_string().fmt(f)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let full = bs58::encode(&self.0).into_string();
        write!(f, "PeerId({}…)", &full[..8.min(full.len())])
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| PeerIdError::Base58)?;
        Self::from_bytes(&bytes)
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let id = PeerId::from_key_bytes(b"some key material");
        let text = id.to_string();
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn equality_by_bytes() {
        let a = PeerId::from_key_bytes(b"a");
        let b = PeerId::from_key_bytes(b"a");
        let c = PeerId::from_key_bytes(b"c");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_wrong_multihash() {
        let mut raw = *PeerId::from_key_bytes(b"x").as_bytes().first_chunk::<34>().unwrap();
        raw[0] = 0x12;
        assert!(PeerId::from_bytes(&raw).is_err());
        assert!(PeerId::from_bytes(&raw[..20]).is_err());
    }
}
