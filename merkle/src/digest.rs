use std::fmt;

use sha1::{Digest as _, Sha1};

/// Width of a chunk digest in bytes.
pub const DIGEST_BYTES: usize = 20;

/// A 20-byte SHA-1 digest. Equality is bytewise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_BYTES]);

impl Digest {
    /// Hash the raw bytes of one chunk. The tail chunk of a region is
    /// hashed over exactly its valid bytes, never padded.
    pub fn of_chunk(bytes: &[u8]) -> Self {
        Digest(Sha1::digest(bytes).into())
    }

    /// Hash an internal node from its two child digests, in order.
    pub fn of_pair(left: &Digest, right: &Digest) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Digest(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_BYTES] {
        &self.0
    }
}

impl From<[u8; DIGEST_BYTES]> for Digest {
    fn from(bytes: [u8; DIGEST_BYTES]) -> Self {
        Digest(bytes)
    }
}

impl fmt::Debug for Digest {
    /// Truncated hex, enough to tell digests apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..6]))
    }
}
