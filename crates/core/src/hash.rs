use std::fmt;

use sha1::{Digest, Sha1};

/// Number of bytes in a [`KeySha`] digest.
pub const HASH_LEN: usize = 20;

/// The SHA-1 digest of a resource key.
///
/// Everywhere below the public surface, a resource is identified by the
/// digest of its UTF-8 encoded key string rather than by the string itself.
/// The key map (see [`crate::db::store::RevisionStore::ensure_key`]) records
/// the digest-to-key association and rejects collisions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeySha {
    pub data: [u8; HASH_LEN],
}

impl KeySha {
    /// Construct from a slice of exactly [`HASH_LEN`] bytes.
    ///
    /// Panics when the length does not match; use only on trusted input.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut data = [0; HASH_LEN];
        data.copy_from_slice(slice);
        Self { data }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.data)
    }
}

/// SHA-1 of an arbitrary byte string.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> KeySha {
    KeySha {
        data: Sha1::digest(bytes).into(),
    }
}

/// Digest of the UTF-8 encoding of a resource key.
pub fn hash_key(key: &str) -> KeySha {
    hash_bytes(key.as_bytes())
}

impl fmt::Display for KeySha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeySha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySha({})", self.to_hex())
    }
}
