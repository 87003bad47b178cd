pub mod framed;
pub mod keys;
pub mod multiaddr;
pub mod peer_id;
pub mod varint;

pub use framed::{FramedError, LpReader, write_msg};
pub use keys::{KeyPair, PublicKey};
pub use multiaddr::{Component, Multiaddr, MultiaddrError};
pub use peer_id::PeerId;
