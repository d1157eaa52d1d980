use rand::RngCore;
use sha1::{Digest, Sha1};

/// Size of a keyed message digest.
pub const DIGEST_SIZE: usize = 20;

/// Computes the keyed SHA-1 digest `sha1(secret || payload)`.
///
/// The secret is the concatenation of the two connection secrets in
/// role-asymmetric order, so a digest computed for one transfer direction
/// does not authenticate the other.
#[inline]
pub fn keyed_digest(secret: &[u8], payload: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    hasher.update(payload);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Verifies a received digest without early exit on the first mismatch.
#[inline]
pub fn verify_digest(secret: &[u8], payload: &[u8], tag: &[u8]) -> bool {
    if tag.len() != DIGEST_SIZE {
        return false;
    }
    let expected = keyed_digest(secret, payload);
    let mut diff = 0u8;
    for (a, b) in expected.iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    rand::thread_rng().fill_bytes(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_size() {
        let digest = keyed_digest(b"ab", b"payload");
        assert_eq!(digest.len(), DIGEST_SIZE);
    }

    #[test]
    fn test_verify_roundtrip() {
        let digest = keyed_digest(b"ab", b"payload");
        assert!(verify_digest(b"ab", b"payload", &digest));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let mut digest = keyed_digest(b"ab", b"payload");
        assert!(!verify_digest(b"ba", b"payload", &digest));
        assert!(!verify_digest(b"ab", b"payloae", &digest));

        digest[3] ^= 0x01;
        assert!(!verify_digest(b"ab", b"payload", &digest));
        assert!(!verify_digest(b"ab", b"payload", &digest[..DIGEST_SIZE - 1]));
    }

    #[test]
    fn test_key_order_matters() {
        // The two transfer directions concatenate the secrets in opposite
        // order and must not produce interchangeable digests.
        assert_ne!(keyed_digest(b"ab", b"x"), keyed_digest(b"ba", b"x"));
    }

    #[test]
    fn test_random_bytes() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        random_bytes(&mut a);
        random_bytes(&mut b);
        assert_ne!(a, b);
    }
}
