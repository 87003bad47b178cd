use async_trait::async_trait;
use cordage::RawConn;
use skein_wire::{
    KeyPair, PeerId,
    framed::{LpReader, write_msg},
};
use x25519_dalek::EphemeralSecret;

use crate::{
    Role, SecureError, SecuredConn, SecurityUpgrader,
    crypt::CryptConn,
    handshake::{CONTEXT_INITIATOR, CONTEXT_RESPONDER, IdentityProof, parse_ephemeral, transcript},
};

const MAX_HANDSHAKE_MSG: usize = 4096;

/// The default security upgrader, filling the `/noise` slot: an XX-shaped
/// exchange of X25519 ephemerals authenticated by transcript-bound ed25519
/// identity signatures, keying one ChaCha20-Poly1305 state per direction.
pub struct NoiseUpgrader {
    keypair: KeyPair,
}

impl NoiseUpgrader {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    #[tracing::instrument(skip_all, fields(local = display(self.keypair.peer_id())))]
    async fn secure_initiator(
        &self,
        mut conn: Box<dyn RawConn>,
        expected: Option<PeerId>,
    ) -> Result<SecuredConn, SecureError> {
        let eph_sk = EphemeralSecret::random_from_rng(rand::thread_rng());
        let eph_pk = x25519_dalek::PublicKey::from(&eph_sk);
        write_msg(&mut conn, eph_pk.as_bytes()).await?;

        let (their_eph, remote_identity, residue) = {
            let mut rdr = LpReader::with_max_size(&mut conn, MAX_HANDSHAKE_MSG);
            let answer = rdr.read_msg().await?;
            if answer.len() != 32 + IdentityProof::LEN {
                return Err(SecureError::MalformedHandshake);
            }
            let their_eph = parse_ephemeral(&answer[..32])?;
            let proof = IdentityProof::from_bytes(&answer[32..])?;
            let identity =
                proof.verify(&transcript(CONTEXT_RESPONDER, &eph_pk, &their_eph))?;
            let (_, residue) = rdr.into_parts();
            (their_eph, identity, residue)
        };
        let remote_peer = remote_identity.peer_id();
        if let Some(expected) = expected
            && expected != remote_peer
        {
            return Err(SecureError::PeerIdMismatch {
                expected,
                got: remote_peer,
            });
        }

        let finisher = IdentityProof {
            identity: self.keypair.public(),
            signature: self
                .keypair
                .sign(&transcript(CONTEXT_INITIATOR, &eph_pk, &their_eph)),
        };
        write_msg(&mut conn, &finisher.bytes()).await?;

        let shared_secret = eph_sk.diffie_hellman(&their_eph);
        let write_key = blake3::derive_key("i2r", shared_secret.as_bytes());
        let read_key = blake3::derive_key("r2i", shared_secret.as_bytes());
        tracing::debug!(remote = display(remote_peer), "initiator handshake done");
        Ok(SecuredConn::new(
            Box::new(CryptConn::new(conn, residue, read_key, write_key)),
            self.keypair.peer_id(),
            remote_peer,
        ))
    }

    #[tracing::instrument(skip_all, fields(local = display(self.keypair.peer_id())))]
    async fn secure_responder(
        &self,
        mut conn: Box<dyn RawConn>,
        expected: Option<PeerId>,
    ) -> Result<SecuredConn, SecureError> {
        let (their_eph, opener_residue) = {
            let mut rdr = LpReader::with_max_size(&mut conn, MAX_HANDSHAKE_MSG);
            let opener = rdr.read_msg().await?;
            let their_eph = parse_ephemeral(&opener)?;
            let (_, residue) = rdr.into_parts();
            (their_eph, residue)
        };

        let eph_sk = EphemeralSecret::random_from_rng(rand::thread_rng());
        let eph_pk = x25519_dalek::PublicKey::from(&eph_sk);
        let mut answer = eph_pk.as_bytes().to_vec();
        answer.extend_from_slice(
            &IdentityProof {
                identity: self.keypair.public(),
                signature: self
                    .keypair
                    .sign(&transcript(CONTEXT_RESPONDER, &their_eph, &eph_pk)),
            }
            .bytes(),
        );
        write_msg(&mut conn, &answer).await?;

        let (remote_identity, residue) = {
            let mut rdr = LpReader::with_residue(&mut conn, opener_residue, MAX_HANDSHAKE_MSG);
            let finisher = rdr.read_msg().await?;
            let proof = IdentityProof::from_bytes(&finisher)?;
            let identity =
                proof.verify(&transcript(CONTEXT_INITIATOR, &their_eph, &eph_pk))?;
            let (_, residue) = rdr.into_parts();
            (identity, residue)
        };
        let remote_peer = remote_identity.peer_id();
        if let Some(expected) = expected
            && expected != remote_peer
        {
            return Err(SecureError::PeerIdMismatch {
                expected,
                got: remote_peer,
            });
        }

        let shared_secret = eph_sk.diffie_hellman(&their_eph);
        let read_key = blake3::derive_key("i2r", shared_secret.as_bytes());
        let write_key = blake3::derive_key("r2i", shared_secret.as_bytes());
        tracing::debug!(remote = display(remote_peer), "responder handshake done");
        Ok(SecuredConn::new(
            Box::new(CryptConn::new(conn, residue, read_key, write_key)),
            self.keypair.peer_id(),
            remote_peer,
        ))
    }
}

#[async_trait]
impl SecurityUpgrader for NoiseUpgrader {
    fn protocol_id(&self) -> &str {
        "/noise"
    }

    async fn secure(
        &self,
        conn: Box<dyn RawConn>,
        role: Role,
        expected_remote_peer: Option<PeerId>,
    ) -> Result<SecuredConn, SecureError> {
        match role {
            Role::Initiator => self.secure_initiator(conn, expected_remote_peer).await,
            Role::Responder => self.secure_responder(conn, expected_remote_peer).await,
        }
    }
}
