//! Handshake seed data and signing.
//!
//! A peer samples [`HandshakeInfo`] from the [`ChainView`] when it is
//! constructed and announces it in the handshake it sends on every connect.
//! The key and signature come from a [`HandshakeSigner`]; [`NullSigner`]
//! produces the all-zero key/signature pair that networks without peer
//! authentication accept.

use crate::types::{Checksum256, PublicKey, Signature, Tstamp};
use crate::NetworkResult;
use parking_lot::RwLock;

/// Network version announced in handshakes.
pub const NETWORK_VERSION: u16 = 1206;

/// Handshake generation counter.
pub const HANDSHAKE_GENERATION: i16 = 1;

/// Local chain positions a handshake advertises.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeInfo {
    pub chain_id: Checksum256,
    pub head_block_num: u32,
    pub head_block_id: Checksum256,
    pub head_block_time: Tstamp,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
}

/// Read access to the local chain state.
pub trait ChainView: Send + Sync + 'static {
    fn handshake_info(&self) -> HandshakeInfo;

    fn head_block_num(&self) -> u32 {
        self.handshake_info().head_block_num
    }

    fn chain_id(&self) -> Checksum256 {
        self.handshake_info().chain_id
    }
}

/// A chain view whose positions are set explicitly.
#[derive(Debug, Default)]
pub struct StaticChain {
    info: RwLock<HandshakeInfo>,
}

impl StaticChain {
    pub fn new(info: HandshakeInfo) -> Self {
        Self {
            info: RwLock::new(info),
        }
    }

    /// A chain at genesis.
    pub fn genesis(chain_id: Checksum256) -> Self {
        Self::new(HandshakeInfo {
            chain_id,
            ..Default::default()
        })
    }

    /// Advance the head (and optionally the irreversible block).
    pub fn set_head(&self, num: u32, id: Checksum256, lib_num: u32, lib_id: Checksum256) {
        let mut info = self.info.write();
        info.head_block_num = num;
        info.head_block_id = id;
        info.head_block_time = Tstamp::now();
        info.last_irreversible_block_num = lib_num;
        info.last_irreversible_block_id = lib_id;
    }
}

impl ChainView for StaticChain {
    fn handshake_info(&self) -> HandshakeInfo {
        self.info.read().clone()
    }
}

/// Provides the key and signature carried in handshakes.
pub trait HandshakeSigner: Send + Sync + 'static {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, token: &Checksum256) -> NetworkResult<Signature>;
}

/// Unauthenticated handshakes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSigner;

impl HandshakeSigner for NullSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::null()
    }

    fn sign(&self, _token: &Checksum256) -> NetworkResult<Signature> {
        Ok(Signature::null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_chain_advances() {
        let chain_id = Checksum256([7u8; 32]);
        let chain = StaticChain::genesis(chain_id);
        assert_eq!(chain.head_block_num(), 0);
        assert_eq!(chain.chain_id(), chain_id);

        chain.set_head(42, Checksum256([1u8; 32]), 30, Checksum256([2u8; 32]));
        let info = chain.handshake_info();
        assert_eq!(info.head_block_num, 42);
        assert_eq!(info.last_irreversible_block_num, 30);
        assert_eq!(info.chain_id, chain_id);
    }

    #[test]
    fn test_null_signer() {
        let signer = NullSigner;
        assert_eq!(signer.public_key(), PublicKey::null());
        assert_eq!(signer.sign(&Checksum256::default()).unwrap(), Signature::null());
    }
}
