//! 64-bit content hashing for chunks, assets and blocks
//!
//! Every index records the identifier of the hasher that produced it; mixing
//! hashers within one store is rejected at the API boundary.

use crate::error::{Error, Result};
use ahash::AHashMap;
use std::sync::Arc;

/// Content digest truncated to 64 bits
pub type Hash = u64;

/// Pack a four character code into a hasher identifier
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

/// Identifier of [`Blake3Hasher`]
pub const BLAKE3_HASH_ID: u32 = fourcc(b"blk3");
/// Identifier of [`Sha1Hasher`]
pub const SHA1_HASH_ID: u32 = fourcc(b"sha1");

/// Streaming hash state
pub trait HashContext: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Finish and return the digest
    fn finalize(self: Box<Self>) -> Hash;
}

/// A hashing algorithm usable for content addressing
pub trait ContentHasher: Send + Sync {
    /// Identifier persisted in indexes
    fn identifier(&self) -> u32;

    /// Start an incremental hash
    fn context(&self) -> Box<dyn HashContext>;

    /// Hash a buffer in one call
    fn hash(&self, data: &[u8]) -> Hash {
        let mut ctx = self.context();
        ctx.update(data);
        ctx.finalize()
    }

    /// Hash a sequence of hashes (used for asset content hashes and block hashes)
    fn hash_hashes(&self, hashes: &[Hash]) -> Hash {
        let mut ctx = self.context();
        for h in hashes {
            ctx.update(&h.to_le_bytes());
        }
        ctx.finalize()
    }
}

fn truncate(digest: &[u8]) -> Hash {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// BLAKE3 truncated to its first 8 bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Hasher;

struct Blake3Context(blake3::Hasher);

impl HashContext for Blake3Context {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Hash {
        truncate(self.0.finalize().as_bytes())
    }
}

impl ContentHasher for Blake3Hasher {
    fn identifier(&self) -> u32 {
        BLAKE3_HASH_ID
    }

    fn context(&self) -> Box<dyn HashContext> {
        Box::new(Blake3Context(blake3::Hasher::new()))
    }

    fn hash(&self, data: &[u8]) -> Hash {
        truncate(blake3::hash(data).as_bytes())
    }
}

/// SHA-1 truncated to its first 8 bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Hasher;

struct Sha1Context(sha1::Sha1);

impl HashContext for Sha1Context {
    fn update(&mut self, data: &[u8]) {
        use sha1::Digest;
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Hash {
        use sha1::Digest;
        truncate(&self.0.finalize())
    }
}

impl ContentHasher for Sha1Hasher {
    fn identifier(&self) -> u32 {
        SHA1_HASH_ID
    }

    fn context(&self) -> Box<dyn HashContext> {
        use sha1::Digest;
        Box::new(Sha1Context(sha1::Sha1::new()))
    }
}

/// Lookup table from hasher identifier to implementation
#[derive(Clone, Default)]
pub struct HashRegistry {
    hashers: AHashMap<u32, Arc<dyn ContentHasher>>,
}

impl HashRegistry {
    /// Registry with no hashers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in hasher
    pub fn full() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Blake3Hasher));
        registry.register(Arc::new(Sha1Hasher));
        registry
    }

    pub fn register(&mut self, hasher: Arc<dyn ContentHasher>) {
        self.hashers.insert(hasher.identifier(), hasher);
    }

    /// Resolve a hasher by identifier
    pub fn get(&self, identifier: u32) -> Result<Arc<dyn ContentHasher>> {
        if identifier == 0 {
            return Err(Error::invalid("hash identifier is not set"));
        }
        self.hashers
            .get(&identifier)
            .cloned()
            .ok_or_else(|| Error::not_supported(format!("hash identifier {:#010x}", identifier)))
    }
}

/// Format a hash the way block file names spell it: `0x` + 16 lowercase hex digits
pub fn to_hex(hash: Hash) -> String {
    format!("0x{}", hex::encode(hash.to_be_bytes()))
}

/// Parse the output of [`to_hex`] (the `0x` prefix is optional)
pub fn from_hex(text: &str) -> Result<Hash> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if digits.len() != 16 {
        return Err(Error::invalid(format!(
            "invalid hash length: expected 16 hex digits, got {}",
            digits.len()
        )));
    }
    let mut bytes = [0u8; 8];
    hex::decode_to_slice(digits, &mut bytes)
        .map_err(|e| Error::invalid(format!("invalid hash {}: {}", text, e)))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"hello world";
        assert_eq!(Blake3Hasher.hash(data), Blake3Hasher.hash(data));
        assert_eq!(Sha1Hasher.hash(data), Sha1Hasher.hash(data));
        assert_ne!(Blake3Hasher.hash(data), Sha1Hasher.hash(data));
    }

    #[test]
    fn test_blake3_matches_reference_prefix() {
        let full = blake3::hash(b"depot");
        let expected = u64::from_le_bytes(full.as_bytes()[..8].try_into().unwrap());
        assert_eq!(Blake3Hasher.hash(b"depot"), expected);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        for hasher in [&Blake3Hasher as &dyn ContentHasher, &Sha1Hasher] {
            let mut ctx = hasher.context();
            ctx.update(b"hello ");
            ctx.update(b"world");
            assert_eq!(ctx.finalize(), hasher.hash(b"hello world"));
        }
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = Blake3Hasher.hash(b"roundtrip");
        let text = to_hex(hash);
        assert_eq!(text.len(), 18);
        assert!(text.starts_with("0x"));
        assert_eq!(from_hex(&text).unwrap(), hash);
        assert_eq!(to_hex(0xab), "0x00000000000000ab");
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(from_hex("0x123").is_err());
        assert!(from_hex("0xzzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HashRegistry::full();
        assert_eq!(registry.get(BLAKE3_HASH_ID).unwrap().identifier(), BLAKE3_HASH_ID);
        assert_eq!(registry.get(SHA1_HASH_ID).unwrap().identifier(), SHA1_HASH_ID);
        assert_eq!(
            registry.get(0).err().unwrap().kind(),
            crate::ErrorKind::InvalidArgument
        );
        assert_eq!(
            registry.get(fourcc(b"nope")).err().unwrap().kind(),
            crate::ErrorKind::NotSupported
        );
    }
}
