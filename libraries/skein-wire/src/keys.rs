use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::peer_id::PeerId;

/// Algorithm tag prefixed to the canonical byte form of a public key.
const TAG_ED25519: u8 = 0x01;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown key algorithm tag {0}")]
    UnknownAlgorithm(u8),
    #[error("key bytes have the wrong shape")]
    Malformed,
    #[error("signature verification failed")]
    BadSignature,
}

/// An identity keypair. Deriving the PeerID from it is a pure function.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public(&self) -> PublicKey {
        PublicKey {
            inner: self.signing.verifying_key(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().peer_id()
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.peer_id())
    }
}

/// A public identity key, serializable to a canonical `[tag || raw]` form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.push(TAG_ED25519);
        out.extend_from_slice(self.inner.as_bytes());
        out
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        match bytes.split_first() {
            Some((&TAG_ED25519, raw)) => {
                let raw: &[u8; 32] = raw.try_into().map_err(|_| KeyError::Malformed)?;
                let inner = VerifyingKey::from_bytes(raw).map_err(|_| KeyError::Malformed)?;
                Ok(Self { inner })
            }
            Some((&tag, _)) => Err(KeyError::UnknownAlgorithm(tag)),
            None => Err(KeyError::Malformed),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_key_bytes(&self.to_canonical_bytes())
    }

    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), KeyError> {
        self.inner.verify(msg, sig).map_err(|_| KeyError::BadSignature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.inner.as_bytes()))
    }
}
