use std::sync::LazyLock;

use arrayref::array_ref;
use ed25519_dalek::Signature;
use skein_wire::PublicKey;

use crate::SecureError;

/// Domain-separation prefixes for the transcript signatures. Each side signs
/// both ephemerals under its own label, so a signature can never be replayed
/// for the opposite role.
pub(crate) const CONTEXT_INITIATOR: &[u8] = b"skein-hs-initiator";
pub(crate) const CONTEXT_RESPONDER: &[u8] = b"skein-hs-responder";

/// The canonical small-order X25519 points (the all-zero point first). Any
/// handshake offering one of these would produce a non-contributory shared
/// secret, so they are rejected before any DH is computed.
static SMALL_ORDER_POINTS: LazyLock<Vec<[u8; 32]>> = LazyLock::new(|| {
    [
        "0000000000000000000000000000000000000000000000000000000000000000",
        "0100000000000000000000000000000000000000000000000000000000000000",
        "e0eb7a7c3b41b8ae1656e3faf19fc46ada098deb9c32b1fd866205165f49b800",
        "5f9c95bca3508c24b1d0b1559c83ef5b04445cc4581c8e86d8224eddd09f1157",
        "ecffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f",
        "edffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f",
        "eeffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff7f",
    ]
    .iter()
    .map(|hex_point| {
        let raw = hex::decode(hex_point).unwrap();
        *array_ref![raw, 0, 32]
    })
    .collect()
});

/// Parses a peer's ephemeral key, refusing the degenerate points.
pub(crate) fn parse_ephemeral(raw: &[u8]) -> Result<x25519_dalek::PublicKey, SecureError> {
    if raw.len() != 32 {
        return Err(SecureError::MalformedHandshake);
    }
    let raw = *array_ref![raw, 0, 32];
    if SMALL_ORDER_POINTS.iter().any(|point| *point == raw) {
        return Err(SecureError::InvalidKey);
    }
    Ok(x25519_dalek::PublicKey::from(raw))
}

/// The transcript a role signs: its label plus both ephemerals in
/// initiator-responder order.
pub(crate) fn transcript(
    context: &[u8],
    eph_initiator: &x25519_dalek::PublicKey,
    eph_responder: &x25519_dalek::PublicKey,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(context.len() + 64);
    out.extend_from_slice(context);
    out.extend_from_slice(eph_initiator.as_bytes());
    out.extend_from_slice(eph_responder.as_bytes());
    out
}

/// An identity bound to a transcript: canonical public key bytes followed by
/// an ed25519 signature.
pub(crate) struct IdentityProof {
    pub identity: PublicKey,
    pub signature: Signature,
}

impl IdentityProof {
    pub const LEN: usize = 33 + 64;

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = self.identity.to_canonical_bytes();
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, SecureError> {
        if raw.len() != Self::LEN {
            return Err(SecureError::MalformedHandshake);
        }
        let identity = PublicKey::from_canonical_bytes(&raw[..33])
            .map_err(|_| SecureError::InvalidKey)?;
        let signature = Signature::from_bytes(array_ref![raw, 33, 64]);
        Ok(Self {
            identity,
            signature,
        })
    }

    /// Checks the proof against a transcript and hands back the identity.
    pub fn verify(self, transcript: &[u8]) -> Result<PublicKey, SecureError> {
        self.identity
            .verify(transcript, &self.signature)
            .map_err(|_| SecureError::BadSignature)?;
        Ok(self.identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_wire::KeyPair;

    #[test]
    fn small_order_points_rejected() {
        assert!(matches!(
            parse_ephemeral(&[0u8; 32]),
            Err(SecureError::InvalidKey)
        ));
        let mut one = [0u8; 32];
        one[0] = 1;
        assert!(matches!(parse_ephemeral(&one), Err(SecureError::InvalidKey)));
    }

    #[test]
    fn honest_ephemeral_accepted() {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::thread_rng());
        let pk = x25519_dalek::PublicKey::from(&secret);
        assert!(parse_ephemeral(pk.as_bytes()).is_ok());
    }

    #[test]
    fn identity_proof_round_trip() {
        let key = KeyPair::generate();
        let eph_a =
            x25519_dalek::PublicKey::from(&x25519_dalek::EphemeralSecret::random_from_rng(
                rand::thread_rng(),
            ));
        let eph_b =
            x25519_dalek::PublicKey::from(&x25519_dalek::EphemeralSecret::random_from_rng(
                rand::thread_rng(),
            ));
        let msg = transcript(CONTEXT_INITIATOR, &eph_a, &eph_b);
        let proof = IdentityProof {
            identity: key.public(),
            signature: key.sign(&msg),
        };
        let raw = proof.bytes();
        let parsed = IdentityProof::from_bytes(&raw).unwrap();
        assert_eq!(parsed.verify(&msg).unwrap(), key.public());

        let other = transcript(CONTEXT_RESPONDER, &eph_a, &eph_b);
        let parsed = IdentityProof::from_bytes(&raw).unwrap();
        assert!(matches!(
            parsed.verify(&other),
            Err(SecureError::BadSignature)
        ));
    }
}
