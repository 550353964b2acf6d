//! Primitive protocol types.

use crate::encoding::{Pack, Unpack};
use crate::{NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte digest used for chain ids, node ids and block ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum256(pub [u8; 32]);

/// Identifier a node announces in handshakes and go-away messages.
pub type NodeId = Checksum256;

impl Checksum256 {
    /// Random value, used for fresh node identifiers.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Checksum256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum256({})", hex::encode(self.0))
    }
}

impl FromStr for Checksum256 {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s)
            .map_err(|e| NetworkError::InvalidMessage(format!("invalid checksum hex: {}", e)))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| {
            NetworkError::InvalidMessage(format!("checksum must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Pack for Checksum256 {
    fn pack(&self, buf: &mut BytesMut) {
        self.0.pack(buf);
    }
}

impl Unpack for Checksum256 {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self(<[u8; 32]>::unpack(buf)?))
    }
}

/// Elliptic curve of a key or signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CurveType {
    K1 = 0,
    R1 = 1,
}

impl TryFrom<u8> for CurveType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CurveType::K1),
            1 => Ok(CurveType::R1),
            _ => Err(NetworkError::InvalidMessage(format!(
                "Unknown curve type: {}",
                value
            ))),
        }
    }
}

/// Compressed public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub curve: CurveType,
    pub data: [u8; 33],
}

impl PublicKey {
    /// The all-zero K1 key peers accept for unauthenticated handshakes.
    pub fn null() -> Self {
        Self {
            curve: CurveType::K1,
            data: [0u8; 33],
        }
    }
}

impl Pack for PublicKey {
    fn pack(&self, buf: &mut BytesMut) {
        (self.curve as u8).pack(buf);
        self.data.pack(buf);
    }
}

impl Unpack for PublicKey {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        let curve = CurveType::try_from(u8::unpack(buf)?)?;
        let data = <[u8; 33]>::unpack(buf)?;
        Ok(Self { curve, data })
    }
}

/// Recoverable signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub curve: CurveType,
    pub data: [u8; 65],
}

impl Signature {
    /// The all-zero K1 signature paired with [`PublicKey::null`].
    pub fn null() -> Self {
        Self {
            curve: CurveType::K1,
            data: [0u8; 65],
        }
    }
}

impl Pack for Signature {
    fn pack(&self, buf: &mut BytesMut) {
        (self.curve as u8).pack(buf);
        self.data.pack(buf);
    }
}

impl Unpack for Signature {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        let curve = CurveType::try_from(u8::unpack(buf)?)?;
        let data = <[u8; 65]>::unpack(buf)?;
        Ok(Self { curve, data })
    }
}

/// Nanoseconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Tstamp(pub i64);

impl Tstamp {
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Self(nanos)
    }
}

impl Pack for Tstamp {
    fn pack(&self, buf: &mut BytesMut) {
        self.0.pack(buf);
    }
}

impl Unpack for Tstamp {
    fn unpack(buf: &mut Bytes) -> NetworkResult<Self> {
        Ok(Self(i64::unpack(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_hex() {
        let hex_id = "aca376f206b8fc25a6ed44dbdc66547c36c6c33e3a119ffbeaef943642f0e906";
        let id: Checksum256 = hex_id.parse().unwrap();
        assert_eq!(id.to_string(), hex_id);
        assert!(!id.is_zero());

        assert!("abcd".parse::<Checksum256>().is_err());
        assert!("zz".parse::<Checksum256>().is_err());
    }

    #[test]
    fn test_null_key_layout() {
        let mut buf = BytesMut::new();
        PublicKey::null().pack(&mut buf);
        Signature::null().pack(&mut buf);
        assert_eq!(buf.len(), 34 + 66);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unknown_curve_rejected() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&[7u8; 34]);
        assert!(PublicKey::unpack(&mut raw.freeze()).is_err());
    }
}
