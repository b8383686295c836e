use sha2::{Digest, Sha256};

pub const DIGEST_LEN: usize = 32;

/// SHA-256 of `bytes`.
pub fn hash(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    Sha256::digest(bytes).into()
}

/// Recomputes the digest of `bytes` and compares it with `expected`.
pub fn verify(bytes: &[u8], expected: &[u8; DIGEST_LEN]) -> bool {
    let actual = hash(bytes);
    // Constant time over the whole digest.
    actual
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_digest(input: &[u8]) -> String {
        hex::encode(hash(input))
    }

    #[test]
    fn matches_fips_180_2_vectors() {
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex_digest(b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq"),
            "248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
        );
    }

    #[test]
    fn million_a_vector() {
        let input = vec![b'a'; 1_000_000];
        assert_eq!(
            hex_digest(&input),
            "cdc76e5c9914fb9281a1c7e284d73e67f1809a48a497200e046d39ccc7112cd0"
        );
    }

    #[test]
    fn verify_rejects_altered_input() {
        let digest = hash(b"left=60 right=40");
        assert!(verify(b"left=60 right=40", &digest));
        assert!(!verify(b"left=61 right=40", &digest));

        let mut tampered = digest;
        tampered[31] ^= 0x01;
        assert!(!verify(b"left=60 right=40", &tampered));
    }
}
