use std::{
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use thiserror::Error;

use crate::{peer_id::PeerId, varint};

/// Parse caps. Anything bigger is rejected outright.
pub const MAX_BYTES: usize = 1024;
pub const MAX_COMPONENTS: usize = 20;

const CODE_IP4: u64 = 4;
const CODE_TCP: u64 = 6;
const CODE_IP6: u64 = 41;
const CODE_UDP: u64 = 273;
const CODE_P2P_CIRCUIT: u64 = 290;
const CODE_P2P: u64 = 421;
const CODE_QUIC_V1: u64 = 461;
const CODE_WS: u64 = 477;
const CODE_MEMORY: u64 = 777;

#[derive(Debug, Error)]
pub enum MultiaddrError {
    #[error("multiaddr of {0} bytes exceeds the 1024-byte cap")]
    TooLong(usize),
    #[error("multiaddr with {0} components exceeds the 20-component cap")]
    TooManyComponents(usize),
    #[error("unknown protocol name {0:?}")]
    UnknownProtocol(String),
    #[error("unknown protocol code {0}")]
    UnknownCode(u64),
    #[error("invalid {0} value")]
    InvalidValue(&'static str),
    #[error("component value is truncated")]
    Truncated,
    #[error("malformed varint in binary multiaddr")]
    InvalidVarint,
}

/// One typed component of a multiaddr. Ordering across components is
/// semantic; the same protocol may appear more than once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Udp(u16),
    QuicV1,
    Ws,
    P2p(PeerId),
    P2pCircuit,
    Memory(u64),
}

impl Component {
    pub fn code(&self) -> u64 {
        match self {
            Component::Ip4(_) => CODE_IP4,
            Component::Ip6(_) => CODE_IP6,
            Component::Tcp(_) => CODE_TCP,
            Component::Udp(_) => CODE_UDP,
            Component::QuicV1 => CODE_QUIC_V1,
            Component::Ws => CODE_WS,
            Component::P2p(_) => CODE_P2P,
            Component::P2pCircuit => CODE_P2P_CIRCUIT,
            Component::Memory(_) => CODE_MEMORY,
        }
    }

    fn write_binary(&self, out: &mut Vec<u8>) {
        let mut vbuf = [0u8; varint::MAX_VARINT_LEN];
        out.extend_from_slice(varint::encode(self.code(), &mut vbuf));
        match self {
            Component::Ip4(ip) => out.extend_from_slice(&ip.octets()),
            Component::Ip6(ip) => out.extend_from_slice(&ip.octets()),
            Component::Tcp(port) | Component::Udp(port) => {
                out.extend_from_slice(&port.to_be_bytes())
            }
            Component::QuicV1 | Component::Ws | Component::P2pCircuit => {}
            Component::P2p(peer) => {
                out.extend_from_slice(varint::encode(peer.as_bytes().len() as u64, &mut vbuf));
                out.extend_from_slice(peer.as_bytes());
            }
            Component::Memory(id) => out.extend_from_slice(&id.to_be_bytes()),
        }
    }

    fn read_binary(code: u64, buf: &[u8]) -> Result<(Self, usize), MultiaddrError> {
        let fixed = |n: usize| {
            if buf.len() < n {
                Err(MultiaddrError::Truncated)
            } else {
                Ok(&buf[..n])
            }
        };
        match code {
            CODE_IP4 => {
                let raw: [u8; 4] = fixed(4)?.try_into().unwrap();
                Ok((Component::Ip4(raw.into()), 4))
            }
            CODE_IP6 => {
                let raw: [u8; 16] = fixed(16)?.try_into().unwrap();
                Ok((Component::Ip6(raw.into()), 16))
            }
            CODE_TCP => {
                let raw: [u8; 2] = fixed(2)?.try_into().unwrap();
                Ok((Component::Tcp(u16::from_be_bytes(raw)), 2))
            }
            CODE_UDP => {
                let raw: [u8; 2] = fixed(2)?.try_into().unwrap();
                Ok((Component::Udp(u16::from_be_bytes(raw)), 2))
            }
            CODE_QUIC_V1 => Ok((Component::QuicV1, 0)),
            CODE_WS => Ok((Component::Ws, 0)),
            CODE_P2P_CIRCUIT => Ok((Component::P2pCircuit, 0)),
            CODE_P2P => {
                let (len, consumed) = varint::decode_usize(buf)
                    .map_err(|_| MultiaddrError::InvalidVarint)?
                    .ok_or(MultiaddrError::Truncated)?;
                let raw = buf
                    .get(consumed..consumed + len)
                    .ok_or(MultiaddrError::Truncated)?;
                let peer =
                    PeerId::from_bytes(raw).map_err(|_| MultiaddrError::InvalidValue("p2p"))?;
                Ok((Component::P2p(peer), consumed + len))
            }
            CODE_MEMORY => {
                let raw: [u8; 8] = fixed(8)?.try_into().unwrap();
                Ok((Component::Memory(u64::from_be_bytes(raw)), 8))
            }
            other => Err(MultiaddrError::UnknownCode(other)),
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Component::Ip4(ip) => write!(f, "/ip4/{ip}"),
            Component::Ip6(ip) => write!(f, "/ip6/{ip}"),
            Component::Tcp(port) => write!(f, "/tcp/{port}"),
            Component::Udp(port) => write!(f, "/udp/{port}"),
            Component::QuicV1 => write!(f, "/quic-v1"),
            Component::Ws => write!(f, "/ws"),
            Component::P2p(peer) => write!(f, "/p2p/{peer}"),
            Component::P2pCircuit => write!(f, "/p2p-circuit"),
            Component::Memory(id) => write!(f, "/memory/{id}"),
        }
    }
}

/// A self-describing network address: an ordered sequence of components with
/// both a textual (`/ip4/1.2.3.4/tcp/4001`) and a binary form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    components: Vec<Component>,
}

impl Multiaddr {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Appends another address's components after this one's.
    pub fn encapsulate(&self, other: &Multiaddr) -> Multiaddr {
        let mut components = self.components.clone();
        components.extend_from_slice(&other.components);
        Multiaddr { components }
    }

    /// The peer identity carried by the last `/p2p` component, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.components.iter().rev().find_map(|c| match c {
            Component::P2p(peer) => Some(*peer),
            _ => None,
        })
    }

    /// Splits a trailing `/p2p` component off, leaving the dialable part.
    pub fn split_peer(&self) -> (Multiaddr, Option<PeerId>) {
        match self.components.last() {
            Some(Component::P2p(peer)) => (
                Multiaddr {
                    components: self.components[..self.components.len() - 1].to_vec(),
                },
                Some(*peer),
            ),
            _ => (self.clone(), None),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![];
        for component in &self.components {
            component.write_binary(&mut out);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MultiaddrError> {
        if bytes.len() > MAX_BYTES {
            return Err(MultiaddrError::TooLong(bytes.len()));
        }
        let mut components = vec![];
        let mut rest = bytes;
        while !rest.is_empty() {
            if components.len() >= MAX_COMPONENTS {
                return Err(MultiaddrError::TooManyComponents(components.len() + 1));
            }
            let (code, consumed) = varint::decode(rest)
                .map_err(|_| MultiaddrError::InvalidVarint)?
                .ok_or(MultiaddrError::Truncated)?;
            rest = &rest[consumed..];
            let (component, consumed) = Component::read_binary(code, rest)?;
            rest = &rest[consumed..];
            components.push(component);
        }
        Ok(Self { components })
    }
}

impl From<Vec<Component>> for Multiaddr {
    fn from(components: Vec<Component>) -> Self {
        Self { components }
    }
}

impl std::fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for component in &self.components {
            component.fmt(f)?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_BYTES {
            return Err(MultiaddrError::TooLong(s.len()));
        }
        let mut parts = s.split('/');
        match parts.next() {
            Some("") => {}
            _ => return Err(MultiaddrError::InvalidValue("leading slash")),
        }
        let mut components = vec![];
        while let Some(name) = parts.next() {
            if components.len() >= MAX_COMPONENTS {
                return Err(MultiaddrError::TooManyComponents(components.len() + 1));
            }
            let mut value = || parts.next().ok_or(MultiaddrError::Truncated);
            let component = match name {
                "ip4" => Component::Ip4(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("ip4"))?,
                ),
                "ip6" => Component::Ip6(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("ip6"))?,
                ),
                "tcp" => Component::Tcp(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("tcp"))?,
                ),
                "udp" => Component::Udp(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("udp"))?,
                ),
                "quic-v1" => Component::QuicV1,
                "ws" => Component::Ws,
                "p2p" => Component::P2p(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("p2p"))?,
                ),
                "p2p-circuit" => Component::P2pCircuit,
                "memory" => Component::Memory(
                    value()?
                        .parse()
                        .map_err(|_| MultiaddrError::InvalidValue("memory"))?,
                ),
                other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
            };
            components.push(component);
        }
        let parsed = Self { components };
        if parsed.to_bytes().len() > MAX_BYTES {
            return Err(MultiaddrError::TooLong(s.len()));
        }
        Ok(parsed)
    }
}

impl serde::Serialize for Multiaddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Multiaddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn text_round_trip() {
        let peer = KeyPair::from_seed([1u8; 32]).peer_id();
        for text in [
            "/ip4/1.2.3.4/tcp/4001".to_string(),
            "/ip6/::1/udp/4001/quic-v1".to_string(),
            format!("/ip4/1.2.3.4/tcp/4001/p2p/{peer}"),
            "/memory/42".to_string(),
            "/ip4/9.9.9.9/tcp/1/p2p-circuit".to_string(),
        ] {
            let addr: Multiaddr = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
            assert_eq!(text.parse::<Multiaddr>().unwrap(), addr);
        }
    }

    #[test]
    fn binary_round_trip() {
        let peer = KeyPair::from_seed([2u8; 32]).peer_id();
        let addr: Multiaddr = format!("/ip6/::1/tcp/9999/p2p/{peer}").parse().unwrap();
        let bytes = addr.to_bytes();
        assert_eq!(Multiaddr::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn ipv6_long_form_canonicalizes() {
        let short: Multiaddr = "/ip6/::1/tcp/1".parse().unwrap();
        let long: Multiaddr = "/ip6/0:0:0:0:0:0:0:1/tcp/1".parse().unwrap();
        assert_eq!(short, long);
        assert_eq!(short.to_string(), "/ip6/::1/tcp/1");
    }

    #[test]
    fn caps_enforced() {
        let oversized = "/ip4/1.2.3.4".repeat(100);
        assert!(matches!(
            oversized.parse::<Multiaddr>(),
            Err(MultiaddrError::TooLong(_))
        ));

        let many = "/p2p-circuit".repeat(21);
        assert!(matches!(
            many.parse::<Multiaddr>(),
            Err(MultiaddrError::TooManyComponents(_))
        ));

        assert!(matches!(
            Multiaddr::from_bytes(&vec![0u8; 1025]),
            Err(MultiaddrError::TooLong(1025))
        ));
    }

    #[test]
    fn rejects_truncated_binary() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        let mut bytes = addr.to_bytes();
        bytes.pop();
        assert!(Multiaddr::from_bytes(&bytes).is_err());
    }

    #[test]
    fn peer_extraction() {
        let peer = KeyPair::from_seed([3u8; 32]).peer_id();
        let addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/4001/p2p/{peer}").parse().unwrap();
        assert_eq!(addr.peer_id(), Some(peer));
        let (dialable, got) = addr.split_peer();
        assert_eq!(got, Some(peer));
        assert_eq!(dialable.to_string(), "/ip4/1.2.3.4/tcp/4001");
        assert_eq!(dialable.peer_id(), None);
    }

    #[test]
    fn encapsulate_appends() {
        let base: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        let suffix: Multiaddr = "/p2p-circuit".parse().unwrap();
        assert_eq!(
            base.encapsulate(&suffix).to_string(),
            "/ip4/1.2.3.4/tcp/4001/p2p-circuit"
        );
    }
}
