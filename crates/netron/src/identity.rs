//! Peer identity.
//!
//! The base58 form of an [`Identity`] is the canonical peer key: it keys the
//! runtime's peer table, tags the definitions served to a peer, and shows up
//! in logs.

use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// Opaque identity bytes of a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(Vec<u8>);

impl Identity {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A fresh random 32-byte identity.
    pub fn random() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_base58(s: &str) -> Result<Self> {
        bs58::decode(s)
            .into_vec()
            .map(Self)
            .map_err(|e| Error::NotValid(format!("Invalid base58 identity '{}': {}", s, e)))
    }

    pub fn as_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_base58())
    }
}

/// Identity plus whatever addressing information the transport layer knows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: Identity,
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: Identity) -> Self {
        Self { id, addrs: Vec::new() }
    }

    pub fn random() -> Self {
        Self::new(Identity::random())
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }
}
