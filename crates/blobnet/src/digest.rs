use std::fmt;

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

pub use blobnet_proto::{DIGEST_LEN, PEER_ID_LEN};

const SHA256_PREFIX: &str = "sha256:";

/// Content identity: a sha256 hash of an immutable blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Hashes `data` in one shot.
    pub fn compute(data: &[u8]) -> Self {
        let out = Sha256::digest(data);
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Self(bytes)
    }

    /// Parses either a bare hex string or the `sha256:<hex>` form.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s.strip_prefix(SHA256_PREFIX).unwrap_or(s);
        if hex_part.len() != DIGEST_LEN * 2 {
            return Err(Error::Parse(format!("digest hex has length {}", hex_part.len())));
        }
        let raw = hex::decode(hex_part).map_err(|e| Error::Parse(format!("digest: {e}")))?;
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    /// Canonical hex form without the algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Hash-ring key: the first four bytes, big-endian.
    pub fn shard_id(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{}", self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", &self.hex()[..8])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(de::Error::custom)
    }
}

/// Opaque per-process peer identifier, stable for the scheduler's lifetime.
/// Ordering is lexicographic on the raw bytes; duplicate-connection
/// tie-breaks rely on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; PEER_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| Error::Parse(format!("peer id: {e}")))?;
        if raw.len() != PEER_ID_LEN {
            return Err(Error::Parse(format!("peer id hex has length {}", s.len())));
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", &self.hex()[..8])
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s).map_err(de::Error::custom)
    }
}

/// A peer as reported by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub ip: String,
    pub port: u16,
    /// Whether the peer has authoritative backend access to the blob.
    #[serde(default)]
    pub origin: bool,
}

impl PeerInfo {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_hex_and_prefixed() {
        let d = Digest::compute(b"hello");
        let bare = Digest::parse(&d.hex()).unwrap();
        let prefixed = Digest::parse(&d.to_string()).unwrap();
        assert_eq!(bare, d);
        assert_eq!(prefixed, d);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Digest::parse("abc").is_err());
        assert!(Digest::parse(&"zz".repeat(DIGEST_LEN)).is_err());
        assert!(Digest::parse(&format!("sha256:{}", "ab".repeat(DIGEST_LEN - 1))).is_err());
    }

    #[test]
    fn test_shard_id_uses_leading_bytes() {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[..4].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(Digest::from_bytes(bytes).shard_id(), 1);
        bytes[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(Digest::from_bytes(bytes).shard_id(), 0xdeadbeef);
    }

    #[test]
    fn test_digest_serde_roundtrip() {
        let d = Digest::compute(b"blob");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_peer_id_roundtrip_and_ordering() {
        let id = PeerId::random();
        assert_eq!(PeerId::parse(&id.hex()).unwrap(), id);

        let small = PeerId::from_bytes([0u8; PEER_ID_LEN]);
        let big = PeerId::from_bytes([0xffu8; PEER_ID_LEN]);
        assert!(small < big);
    }
}
