/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use mail_builder::encoders::base64::base64_encode;

use super::canonical::{BodyCanonicalizer, Canonicalization};
use super::crypto::{HashAlgorithm, HashContext};
use super::Writer;

/// Identifies one distinct body digest: canonicalization, hash algorithm and
/// the `l=` byte limit. The limit counts canonicalized bytes; zero means
/// unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHashKey {
    pub canonicalization: Canonicalization,
    pub algorithm: HashAlgorithm,
    pub limit: u64,
}

impl BodyHashKey {
    pub fn new(canonicalization: Canonicalization, algorithm: HashAlgorithm, limit: u64) -> Self {
        BodyHashKey {
            canonicalization,
            algorithm,
            limit,
        }
    }
}

/// Caps the number of canonicalized bytes fed into the hash; overflow is
/// consumed and discarded.
#[derive(Debug)]
struct LimitedHash {
    context: HashContext,
    remaining: Option<u64>,
}

impl Writer for LimitedHash {
    fn write(&mut self, buf: &[u8]) {
        match &mut self.remaining {
            None => self.context.write(buf),
            Some(remaining) => {
                let take = (*remaining).min(buf.len() as u64) as usize;
                if take > 0 {
                    self.context.write(&buf[..take]);
                    *remaining -= take as u64;
                }
            }
        }
    }
}

/// One streaming canonicalizer+hasher pair.
#[derive(Debug)]
pub struct BodyHasher {
    key: BodyHashKey,
    canonicalizer: BodyCanonicalizer<LimitedHash>,
}

impl BodyHasher {
    pub fn new(key: BodyHashKey) -> Self {
        let hash = LimitedHash {
            context: HashContext::new(key.algorithm),
            remaining: if key.limit > 0 { Some(key.limit) } else { None },
        };
        BodyHasher {
            key,
            canonicalizer: BodyCanonicalizer::new(key.canonicalization, hash),
        }
    }

    pub fn key(&self) -> &BodyHashKey {
        &self.key
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.canonicalizer.write(chunk);
    }

    /// Flushes the canonicalizer and returns the base64 digest.
    pub fn close(self) -> (BodyHashKey, String) {
        let hash = self.canonicalizer.close();
        let digest = base64_encode(&hash.context.finalize()).unwrap_or_default();
        (self.key, String::from_utf8(digest).unwrap_or_default())
    }
}

/// Fans one body stream out to a deduplicated set of [`BodyHasher`]s. All
/// hashers must be registered before the first `write`; digests become
/// available after `close`.
#[derive(Debug, Default)]
pub struct MultiBodyHash {
    hashers: Vec<BodyHasher>,
    digests: Vec<(BodyHashKey, String)>,
}

impl MultiBodyHash {
    pub fn new() -> Self {
        MultiBodyHash::default()
    }

    /// Registers a body-hash key; inserting an existing key is a no-op.
    pub fn add_body_hash(&mut self, key: BodyHashKey) {
        if !self.hashers.iter().any(|hasher| hasher.key() == &key) {
            self.hashers.push(BodyHasher::new(key));
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        for hasher in &mut self.hashers {
            hasher.write(chunk);
        }
    }

    pub fn close(&mut self) {
        for hasher in std::mem::take(&mut self.hashers) {
            self.digests.push(hasher.close());
        }
    }

    /// The digest for a key, if that key was registered before streaming.
    pub fn get(&self, key: &BodyHashKey) -> Option<&str> {
        self.digests
            .iter()
            .find(|(digest_key, _)| digest_key == key)
            .map(|(_, digest)| digest.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest(
        body: &[&str],
        canonicalization: Canonicalization,
        algorithm: HashAlgorithm,
        limit: u64,
    ) -> String {
        let mut hasher = BodyHasher::new(BodyHashKey::new(canonicalization, algorithm, limit));
        for chunk in body {
            hasher.write(chunk.as_bytes());
        }
        hasher.close().1
    }

    #[test]
    fn body_hash_digests() {
        for (body, canonicalization, algorithm, expected) in [
            (
                "\r\ntest",
                Canonicalization::Simple,
                HashAlgorithm::Sha256,
                "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=",
            ),
            (
                "\r\ntest",
                Canonicalization::Relaxed,
                HashAlgorithm::Sha256,
                "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=",
            ),
            (
                "hoge  \r\ntest\r\n  \r\n",
                Canonicalization::Relaxed,
                HashAlgorithm::Sha256,
                "LqSAdhsGjY2uv8fGWJMIM2akhHN9NyGGEUlN+xik7jE=",
            ),
            (
                "test\r\n",
                Canonicalization::Relaxed,
                HashAlgorithm::Sha256,
                "g3zLYH4xKxcPrHOD18z9YfpQcnk/GaJedfustWU5uGs=",
            ),
            (
                "\r\ntest",
                Canonicalization::Simple,
                HashAlgorithm::Sha1,
                "RncHNkkRgpHaoq2sZDSLD5ey4Pc=",
            ),
            (
                "\r\ntest",
                Canonicalization::Relaxed,
                HashAlgorithm::Sha1,
                "RncHNkkRgpHaoq2sZDSLD5ey4Pc=",
            ),
            (
                "hoge  \r\ntest\r\n  \r\n",
                Canonicalization::Relaxed,
                HashAlgorithm::Sha1,
                "A7Vq/LMkg+KV7mmH87z7XbR1/kQ=",
            ),
        ] {
            assert_eq!(
                digest(&[body], canonicalization, algorithm, 0),
                expected,
                "{body:?} {canonicalization} {algorithm:?}"
            );
        }
    }

    #[test]
    fn limit_caps_canonicalized_bytes() {
        // The canonicalized stream is "\r\ntest\r\n" (8 bytes); a limit at
        // or above that length leaves the digest unchanged.
        assert_eq!(
            digest(&["\r\ntest"], Canonicalization::Simple, HashAlgorithm::Sha256, 8),
            "XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=",
        );

        // Bodies diverging past the limit hash identically.
        let first = digest(
            &["\r\ntest_aaaa"],
            Canonicalization::Simple,
            HashAlgorithm::Sha256,
            8,
        );
        let second = digest(
            &["\r\ntest_abbb"],
            Canonicalization::Simple,
            HashAlgorithm::Sha256,
            8,
        );
        assert_eq!(first, second);

        let unlimited = digest(
            &["\r\ntest_aaaa"],
            Canonicalization::Simple,
            HashAlgorithm::Sha256,
            0,
        );
        assert_ne!(first, unlimited);
    }

    #[test]
    fn chunked_body_hash() {
        let expected = digest(
            &["hoge  \r\ntest\r\n  \r\n"],
            Canonicalization::Relaxed,
            HashAlgorithm::Sha256,
            0,
        );
        assert_eq!(
            digest(
                &["hoge ", " \r", "\ntest", "\r\n  \r\n"],
                Canonicalization::Relaxed,
                HashAlgorithm::Sha256,
                0,
            ),
            expected
        );
    }

    #[test]
    fn multi_body_hash() {
        let relaxed_sha256 =
            BodyHashKey::new(Canonicalization::Relaxed, HashAlgorithm::Sha256, 0);
        let simple_sha1 = BodyHashKey::new(Canonicalization::Simple, HashAlgorithm::Sha1, 0);
        let never_added = BodyHashKey::new(Canonicalization::Simple, HashAlgorithm::Sha256, 0);

        let mut multi = MultiBodyHash::new();
        multi.add_body_hash(relaxed_sha256);
        multi.add_body_hash(relaxed_sha256);
        multi.add_body_hash(simple_sha1);

        multi.write(b"\r\nte");
        multi.write(b"st");
        multi.close();

        assert_eq!(
            multi.get(&relaxed_sha256),
            Some("XgF6uYzcgcROQtd83d1Evx8x2uW+SniFx69skZp5azo=")
        );
        assert_eq!(multi.get(&simple_sha1), Some("RncHNkkRgpHaoq2sZDSLD5ey4Pc="));
        assert_eq!(multi.get(&never_added), None);
    }

    #[test]
    fn digests_non_empty_for_all_registered_keys() {
        let keys = [
            BodyHashKey::new(Canonicalization::Simple, HashAlgorithm::Sha256, 0),
            BodyHashKey::new(Canonicalization::Relaxed, HashAlgorithm::Sha256, 0),
            BodyHashKey::new(Canonicalization::Relaxed, HashAlgorithm::Sha1, 12),
        ];
        let mut multi = MultiBodyHash::new();
        for key in keys {
            multi.add_body_hash(key);
        }
        multi.write(b"");
        multi.close();
        for key in keys {
            assert!(!multi.get(&key).unwrap().is_empty());
        }
    }
}
