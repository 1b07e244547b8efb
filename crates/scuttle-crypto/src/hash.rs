//! SHA-2 hashing helpers.

use sha2::{Digest, Sha256, Sha512};

/// Computes SHA-256 over `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Computes SHA-512 over `data`.
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&Sha512::digest(data));
    out
}

/// Incremental SHA-256, used when streaming blob contents to disk.
pub struct Sha256Stream {
    inner: Sha256,
}

impl Sha256Stream {
    /// Creates a fresh hasher.
    pub fn new() -> Self {
        Self { inner: Sha256::new() }
    }

    /// Feeds a chunk into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalizes and returns the digest.
    pub fn finalize(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.inner.finalize());
        out
    }
}

impl Default for Sha256Stream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        let digest = sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut s = Sha256Stream::new();
        s.update(b"hello, ");
        s.update(b"world");
        assert_eq!(s.finalize(), sha256(b"hello, world"));
    }
}
