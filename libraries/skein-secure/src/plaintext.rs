use async_trait::async_trait;
use cordage::RawConn;
use skein_select::ResidueConn;
use skein_wire::{
    KeyPair, PeerId, PublicKey,
    framed::{LpReader, write_msg},
};

use crate::{Role, SecureError, SecuredConn, SecurityUpgrader};

/// The `/plaintext/2.0.0` upgrader: both sides swap public keys and nothing
/// is encrypted or proven. Identities are taken on faith, so this exists for
/// tests and benchmarks only.
pub struct PlaintextUpgrader {
    keypair: KeyPair,
}

impl PlaintextUpgrader {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl SecurityUpgrader for PlaintextUpgrader {
    fn protocol_id(&self) -> &str {
        "/plaintext/2.0.0"
    }

    async fn secure(
        &self,
        mut conn: Box<dyn RawConn>,
        _role: Role,
        expected_remote_peer: Option<PeerId>,
    ) -> Result<SecuredConn, SecureError> {
        write_msg(&mut conn, &self.keypair.public().to_canonical_bytes()).await?;
        let (remote_key, residue) = {
            let mut rdr = LpReader::with_max_size(&mut conn, 1024);
            let raw = rdr.read_msg().await?;
            let key =
                PublicKey::from_canonical_bytes(&raw).map_err(|_| SecureError::InvalidKey)?;
            let (_, residue) = rdr.into_parts();
            (key, residue)
        };
        let remote_peer = remote_key.peer_id();
        if let Some(expected) = expected_remote_peer
            && expected != remote_peer
        {
            return Err(SecureError::PeerIdMismatch {
                expected,
                got: remote_peer,
            });
        }
        tracing::debug!(remote = display(remote_peer), "plaintext key exchange done");
        Ok(SecuredConn::new(
            Box::new(ResidueConn::new(conn, residue)),
            self.keypair.peer_id(),
            remote_peer,
        ))
    }
}
