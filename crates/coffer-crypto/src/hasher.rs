use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, LazyLock};

use coffer_types::ContentKey;
use sha2::Digest;

use crate::error::CryptoError;
use crate::memo::DigestMemo;

/// Digest algorithms available to Coffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// SHA-256, the default and the interoperable choice.
    Sha256,
    /// BLAKE3 with its default 32-byte output.
    Blake3,
}

impl Algorithm {
    /// Interop name of the algorithm.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Blake3 => "BLAKE3",
        }
    }
}

/// Incremental digest state for one payload.
pub enum Digester {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            Algorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Feed more payload bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and produce the key.
    pub fn finalize(self) -> ContentKey {
        match self {
            Self::Sha256(h) => ContentKey::from_digest(h.finalize().into()),
            Self::Blake3(h) => ContentKey::from_digest(*h.finalize().as_bytes()),
        }
    }
}

/// A named, deterministic digest algorithm producing [`ContentKey`]s.
///
/// Instances are process-wide singletons obtained from [`HashFunction::sha256`],
/// [`HashFunction::blake3`] or [`HashFunction::get`]. Each carries its own
/// [`DigestMemo`], so memoized digests never leak between algorithms.
pub struct HashFunction {
    algorithm: Algorithm,
    memo: DigestMemo,
}

static SHA256: LazyLock<HashFunction> = LazyLock::new(|| HashFunction::new(Algorithm::Sha256));
static BLAKE3: LazyLock<HashFunction> = LazyLock::new(|| HashFunction::new(Algorithm::Blake3));

const READ_CHUNK: usize = 64 * 1024;

impl HashFunction {
    fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            memo: DigestMemo::default(),
        }
    }

    /// The SHA-256 function (the default).
    pub fn sha256() -> &'static HashFunction {
        &SHA256
    }

    /// The BLAKE3 function.
    pub fn blake3() -> &'static HashFunction {
        &BLAKE3
    }

    /// All registered functions.
    pub fn all() -> [&'static HashFunction; 2] {
        [Self::sha256(), Self::blake3()]
    }

    /// Names of all registered functions.
    pub fn names() -> Vec<&'static str> {
        Self::all().iter().map(|f| f.name()).collect()
    }

    /// Resolve a function by its interop name (case-insensitive).
    pub fn get(name: &str) -> Result<&'static HashFunction, CryptoError> {
        Self::all()
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| CryptoError::UnknownFunction(name.to_string()))
    }

    /// Interop name of this function.
    pub fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// The underlying algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Start an incremental digest.
    pub fn digester(&self) -> Digester {
        Digester::new(self.algorithm)
    }

    /// Digest a byte slice.
    pub fn digest_bytes(&self, data: &[u8]) -> ContentKey {
        let mut d = self.digester();
        d.update(data);
        d.finalize()
    }

    /// Digest everything a reader yields.
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> io::Result<ContentKey> {
        let mut d = self.digester();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            d.update(&buf[..n]);
        }
        Ok(d.finalize())
    }

    /// Digest a shared, immutable payload, memoized by payload identity.
    ///
    /// The memo holds a weak handle on the `Arc`; see [`DigestMemo`] for why
    /// `T` owns its bytes out of line.
    pub fn digest_shared<T>(&self, payload: &Arc<T>) -> ContentKey
    where
        T: AsRef<[u8]> + Send + Sync + 'static,
    {
        self.memo
            .get_or_compute(payload, |p| self.digest_bytes(p.as_ref()))
    }

    /// Verify that data produces the expected key.
    pub fn verify(&self, data: &[u8], expected: &ContentKey) -> bool {
        self.digest_bytes(data) == *expected
    }

    /// The memo table of this function.
    pub fn memo(&self) -> &DigestMemo {
        &self.memo
    }
}

impl PartialEq for HashFunction {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm
    }
}

impl Eq for HashFunction {}

impl fmt::Debug for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashFunction({})", self.name())
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sha256_matches_known_vector() {
        let key = HashFunction::sha256().digest_bytes(b"abc");
        assert_eq!(
            key.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn blake3_matches_library() {
        let key = HashFunction::blake3().digest_bytes(b"abc");
        assert_eq!(key.as_bytes(), blake3::hash(b"abc").as_bytes());
    }

    #[test]
    fn algorithms_disagree() {
        let data = b"same content";
        assert_ne!(
            HashFunction::sha256().digest_bytes(data),
            HashFunction::blake3().digest_bytes(data)
        );
    }

    #[test]
    fn registry_resolves_by_name() {
        assert_eq!(HashFunction::get("SHA-256").unwrap(), HashFunction::sha256());
        assert_eq!(HashFunction::get("blake3").unwrap(), HashFunction::blake3());
        assert!(std::ptr::eq(
            HashFunction::get("sha-256").unwrap(),
            HashFunction::sha256()
        ));
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let err = HashFunction::get("MD5").unwrap_err();
        assert_eq!(err, CryptoError::UnknownFunction("MD5".into()));
    }

    #[test]
    fn names_lists_every_function() {
        assert_eq!(HashFunction::names(), vec!["SHA-256", "BLAKE3"]);
    }

    #[test]
    fn reader_digest_spans_chunks() {
        let data = vec![0x5au8; READ_CHUNK * 2 + 17];
        let f = HashFunction::sha256();
        assert_eq!(f.digest_reader(&data[..]).unwrap(), f.digest_bytes(&data));
    }

    #[test]
    fn shared_digest_is_memoized() {
        let f = HashFunction::blake3();
        let payload = Arc::new(b"memoized through the function".to_vec());
        let before = f.memo().stats().hits;
        let k1 = f.digest_shared(&payload);
        let k2 = f.digest_shared(&payload);
        assert_eq!(k1, k2);
        assert_eq!(k1, f.digest_bytes(&payload));
        assert!(f.memo().stats().hits > before);
    }

    #[test]
    fn verify_detects_tampering() {
        let f = HashFunction::sha256();
        let key = f.digest_bytes(b"original");
        assert!(f.verify(b"original", &key));
        assert!(!f.verify(b"tampered", &key));
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            for f in HashFunction::all() {
                let once = f.digest_bytes(&data);
                prop_assert_eq!(once, f.digest_bytes(&data));
                prop_assert_eq!(once, f.digest_reader(&data[..]).unwrap());
                let shared = Arc::new(data.clone());
                prop_assert_eq!(once, f.digest_shared(&shared));
            }
        }
    }
}
