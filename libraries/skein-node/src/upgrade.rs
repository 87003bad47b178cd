use std::sync::Arc;

use braidmux::{BraidMux, MuxConfig, MuxRole};
use cordage::RawConn;
use futures_util::AsyncReadExt;
use skein_secure::{Role, SecuredConn, SecurityUpgrader};
use skein_select::{ResidueConn, SelectError, negotiate_inbound, negotiate_outbound, negotiate_outbound_lazy};
use skein_wire::{Multiaddr, PeerId};

use crate::{
    errors::UpgradeError,
    gater::{ConnectionGater, GateStage},
    pool::Direction,
};

pub const MUXER_YAMUX: &str = "/yamux/1.0.0";

/// The separator carrying an early muxer hint inside a security protocol
/// announcement, e.g. `/noise;mux=/yamux/1.0.0`. When both sides settle on a
/// hinted announcement, the muxer negotiation round is skipped entirely.
const ALPN_SEP: &str = ";mux=";

/// A fully upgraded connection: authenticated, encrypted, multiplexed.
pub struct UpgradedConn {
    pub mux: BraidMux,
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    pub security_protocol: String,
    pub muxer_protocol: String,
}

impl std::fmt::Debug for UpgradedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UpgradedConn(remote={}, sec={}, mux={})",
            self.remote_peer, self.security_protocol, self.muxer_protocol
        )
    }
}

/// Composes the upgrade pipeline: security negotiation, the security
/// handshake itself, the secured-stage gate, muxer negotiation (or the ALPN
/// shortcut), and muxer instantiation.
pub struct Upgrader {
    security: Vec<Arc<dyn SecurityUpgrader>>,
    muxers: Vec<String>,
    mux_cfg: MuxConfig,
    gater: Arc<dyn ConnectionGater>,
}

impl Upgrader {
    pub fn new(
        security: Vec<Arc<dyn SecurityUpgrader>>,
        mux_cfg: MuxConfig,
        gater: Arc<dyn ConnectionGater>,
    ) -> Self {
        Self {
            security,
            muxers: vec![MUXER_YAMUX.to_string()],
            mux_cfg,
            gater,
        }
    }

    /// Every security announcement, hinted variants first so capable peers
    /// save the muxer round trip.
    fn security_menu(&self) -> Vec<String> {
        let mut menu = vec![];
        for upgrader in &self.security {
            for muxer in &self.muxers {
                menu.push(format!("{}{}{}", upgrader.protocol_id(), ALPN_SEP, muxer));
            }
        }
        for upgrader in &self.security {
            menu.push(upgrader.protocol_id().to_string());
        }
        menu
    }

    fn upgrader_for(&self, id: &str) -> Option<Arc<dyn SecurityUpgrader>> {
        self.security
            .iter()
            .find(|u| u.protocol_id() == id)
            .cloned()
    }

    #[tracing::instrument(skip_all, fields(role = debug(role)))]
    pub async fn upgrade(
        &self,
        mut conn: Box<dyn RawConn>,
        role: Role,
        expected_remote_peer: Option<PeerId>,
        direction: Direction,
    ) -> Result<UpgradedConn, UpgradeError> {
        if self.security.is_empty() {
            return Err(UpgradeError::NoSecurityUpgraders);
        }
        if self.muxers.is_empty() {
            return Err(UpgradeError::NoMuxers);
        }
        let remote_addr = conn.remote_addr();

        // security negotiation over the raw connection
        let menu = self.security_menu();
        let menu_refs: Vec<&str> = menu.iter().map(String::as_str).collect();
        let negotiated = match role {
            Role::Initiator => negotiate_outbound(&mut conn, &menu_refs).await,
            Role::Responder => negotiate_inbound(&mut conn, &menu_refs).await,
        }
        .map_err(|err| match err {
            SelectError::ProtocolNegotiationFailed(id) => {
                UpgradeError::SecurityNegotiationFailed(id)
            }
            other => UpgradeError::Select(other),
        })?;
        let (security_id, muxer_hint) = match negotiated.protocol.split_once(ALPN_SEP) {
            Some((sec, muxer)) => (sec.to_string(), Some(muxer.to_string())),
            None => (negotiated.protocol.clone(), None),
        };
        let upgrader = self
            .upgrader_for(&security_id)
            .ok_or_else(|| UpgradeError::SecurityNegotiationFailed(security_id.clone()))?;

        // the handshake itself
        let raw: Box<dyn RawConn> = Box::new(ResidueConn::new(conn, negotiated.residue));
        let secured = upgrader.secure(raw, role, expected_remote_peer).await?;
        let local_peer = secured.local_peer();
        let remote_peer = secured.remote_peer();

        if !self.gater.intercept_secured(remote_peer, direction) {
            return Err(UpgradeError::ConnectionGated(GateStage::Secured));
        }

        // muxer selection, skipped when ALPN already settled it
        let (muxer_protocol, mux) = match muxer_hint {
            Some(muxer) => (
                muxer,
                self.instantiate_mux(secured, Default::default(), role),
            ),
            None => {
                let mut secured = secured;
                let negotiated = match role {
                    Role::Initiator => {
                        // a single proposal, so the lazy 0-RTT form applies
                        negotiate_outbound_lazy(&mut secured, MUXER_YAMUX, &[]).await
                    }
                    Role::Responder => {
                        let muxer_refs: Vec<&str> =
                            self.muxers.iter().map(String::as_str).collect();
                        negotiate_inbound(&mut secured, &muxer_refs).await
                    }
                }
                .map_err(|err| match err {
                    SelectError::ProtocolNegotiationFailed(id) => {
                        UpgradeError::MuxerNegotiationFailed(id)
                    }
                    other => UpgradeError::Select(other),
                })?;
                (
                    negotiated.protocol,
                    self.instantiate_mux(secured, negotiated.residue, role),
                )
            }
        };

        tracing::debug!(
            remote = display(remote_peer),
            security = security_id,
            muxer = muxer_protocol,
            "connection upgraded"
        );
        Ok(UpgradedConn {
            mux,
            local_peer,
            remote_peer,
            remote_addr,
            security_protocol: security_id,
            muxer_protocol,
        })
    }

    fn instantiate_mux(
        &self,
        secured: SecuredConn,
        residue: bytes::BytesMut,
        role: Role,
    ) -> BraidMux {
        let mux_role = match role {
            Role::Initiator => MuxRole::Initiator,
            Role::Responder => MuxRole::Responder,
        };
        let (read, write) = ResidueConn::new(secured, residue).split();
        BraidMux::new(read, write, mux_role, self.mux_cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordage::{Transport, memory::MemoryTransport};
    use futures_lite::future::zip;
    use futures_util::{AsyncReadExt, AsyncWriteExt};
    use skein_secure::{NoiseUpgrader, PlaintextUpgrader};
    use skein_wire::KeyPair;

    use crate::gater::AllowAll;

    async fn raw_pair() -> (Box<dyn RawConn>, Box<dyn RawConn>) {
        let mut listener = MemoryTransport
            .listen(&"/memory/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (dialed, accepted) = zip(MemoryTransport.dial(&addr), listener.accept()).await;
        (dialed.unwrap(), accepted.unwrap())
    }

    fn upgrader(key: KeyPair, plaintext: bool) -> Upgrader {
        let security: Vec<Arc<dyn SecurityUpgrader>> = if plaintext {
            vec![Arc::new(PlaintextUpgrader::new(key))]
        } else {
            vec![Arc::new(NoiseUpgrader::new(key))]
        };
        Upgrader::new(security, MuxConfig::default(), Arc::new(AllowAll))
    }

    async fn pipeline_round_trip(plaintext: bool) {
        let client_key = KeyPair::generate();
        let server_key = KeyPair::generate();
        let server_peer = server_key.peer_id();
        let (client_raw, server_raw) = raw_pair().await;

        let client_up = upgrader(client_key, plaintext);
        let server_up = upgrader(server_key, plaintext);
        let (client, server) = zip(
            client_up.upgrade(
                client_raw,
                Role::Initiator,
                Some(server_peer),
                Direction::Outbound,
            ),
            server_up.upgrade(server_raw, Role::Responder, None, Direction::Inbound),
        )
        .await;
        let (client, server) = (client.unwrap(), server.unwrap());

        assert_eq!(client.remote_peer, server_peer);
        assert_eq!(server.remote_peer, client.local_peer);
        // both sides settled on the hinted announcement: no muxer round
        assert_eq!(client.muxer_protocol, MUXER_YAMUX);
        assert_eq!(server.muxer_protocol, MUXER_YAMUX);
        assert!(client.security_protocol.starts_with('/'));

        // streams actually move bytes through the upgraded stack
        let exchange_client = async {
            let mut stream = client.mux.open().await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            stream.flush().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        };
        let exchange_server = async {
            let mut stream = server.mux.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.flush().await.unwrap();
        };
        zip(exchange_client, exchange_server).await;
    }

    #[test]
    fn noise_pipeline() {
        smolscale::block_on(pipeline_round_trip(false))
    }

    #[test]
    fn plaintext_pipeline() {
        smolscale::block_on(pipeline_round_trip(true))
    }

    #[test]
    fn security_mismatch_fails_cleanly() {
        smolscale::block_on(async {
            let (client_raw, server_raw) = raw_pair().await;
            let client_up = upgrader(KeyPair::generate(), true);
            let server_up = upgrader(KeyPair::generate(), false);
            let (client, server) = zip(
                client_up.upgrade(client_raw, Role::Initiator, None, Direction::Outbound),
                server_up.upgrade(server_raw, Role::Responder, None, Direction::Inbound),
            )
            .await;
            assert!(matches!(
                client.unwrap_err(),
                UpgradeError::SecurityNegotiationFailed(_)
            ));
            assert!(server.is_err());
        })
    }
}
