//! Format-transforming cipher seam and the per-machine cipher cache.
//!
//! The regex-to-DFA engine that actually ranks and unranks language
//! strings is an external collaborator. The engine only needs the
//! [`Cipher`] contract: a fixed plaintext capacity, encrypt into the
//! target language, decrypt a prefix of buffered ciphertext, and release
//! native resources on close.
//!
//! Ciphers are built lazily per `(regex, message length)` pair and live
//! until the owning machine resets.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// A format-transforming cipher for one (regex, message length) pair.
pub trait Cipher: Send + Sync {
    /// Plaintext bytes carried per ciphertext message.
    fn capacity(&self) -> usize;

    /// Encrypts `plaintext` into a string of the target language.
    ///
    /// # Errors
    ///
    /// Fails when the plaintext exceeds the cipher's capacity or the
    /// engine rejects it.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts a prefix of `ciphertext`. Returns `Ok(None)` when the
    /// input does not yet hold a complete message; on success returns the
    /// plaintext and the number of ciphertext bytes consumed, leaving the
    /// remainder for the caller to preserve.
    ///
    /// # Errors
    ///
    /// A message that can never parse is an error and fatal to the cycle.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Option<(Vec<u8>, usize)>>;

    /// Releases native resources.
    ///
    /// # Errors
    ///
    /// Close failures are reported so callers can log them; the cipher is
    /// forgotten either way.
    fn close(&self) -> Result<()>;
}

/// Factory building ciphers on demand; the DFA engine lives behind this
/// seam.
pub trait CipherSuite: Send + Sync {
    /// Opens a cipher for the given regex and message length.
    ///
    /// # Errors
    ///
    /// Fails when the regex cannot be compiled into a usable language.
    fn open(&self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CipherKey {
    regex: String,
    msg_len: usize,
}

/// Per-machine cache of open ciphers.
pub(crate) struct CipherCache {
    suite: Arc<dyn CipherSuite>,
    open: HashMap<CipherKey, Arc<dyn Cipher>>,
}

impl CipherCache {
    pub(crate) fn new(suite: Arc<dyn CipherSuite>) -> Self {
        Self { suite, open: HashMap::new() }
    }

    /// Returns the cached cipher for the pair, opening one on first use.
    pub(crate) fn get(&mut self, regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
        let key = CipherKey { regex: regex.to_string(), msg_len };
        if let Some(cipher) = self.open.get(&key) {
            return Ok(Arc::clone(cipher));
        }
        let cipher = self.suite.open(regex, msg_len)?;
        self.open.insert(key, Arc::clone(&cipher));
        Ok(cipher)
    }

    /// Closes and forgets every cached cipher.
    pub(crate) fn reset(&mut self) {
        for (key, cipher) in self.open.drain() {
            if let Err(error) = cipher.close() {
                tracing::error!(regex = %key.regex, %error, "cannot close cipher");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::Error;

    struct CountingSuite {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    struct CountingCipher {
        closed: Arc<AtomicUsize>,
    }

    impl Cipher for CountingCipher {
        fn capacity(&self) -> usize {
            32
        }

        fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Cipher("unused".into()))
        }

        fn decrypt(&self, _ciphertext: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
            Err(Error::Cipher("unused".into()))
        }

        fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl CipherSuite for CountingSuite {
        fn open(&self, _regex: &str, _msg_len: usize) -> Result<Arc<dyn Cipher>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingCipher { closed: Arc::clone(&self.closed) }))
        }
    }

    #[test]
    fn cache_reuses_open_ciphers() {
        let closed = Arc::new(AtomicUsize::new(0));
        let suite =
            Arc::new(CountingSuite { opened: AtomicUsize::new(0), closed: Arc::clone(&closed) });
        let mut cache = CipherCache::new(Arc::clone(&suite) as Arc<dyn CipherSuite>);

        cache.get("^a+$", 64).unwrap();
        cache.get("^a+$", 64).unwrap();
        cache.get("^a+$", 128).unwrap();
        assert_eq!(suite.opened.load(Ordering::SeqCst), 2);

        cache.reset();
        assert_eq!(closed.load(Ordering::SeqCst), 2);

        cache.get("^a+$", 64).unwrap();
        assert_eq!(suite.opened.load(Ordering::SeqCst), 3);
    }
}
