//! A reversible fixed-length cipher suite for tests.
//!
//! `StubCipher` stands in for the format-transforming engine. Messages
//! are exactly `msg_len` bytes: an 8-hex-digit payload length, the hex
//! payload, and `x` filler, so ciphertexts match guard patterns like
//! `^[0-9a-fx]+` while staying trivially reversible. Every cipher records
//! whether it has been closed, which lets tests observe the cache's
//! release discipline.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use marionette_core::{Cipher, CipherSuite, Error, Result};

const LEN_DIGITS: usize = 8;

/// Cipher factory handing out close-observable stub ciphers.
pub struct StubSuite {
    opened: Mutex<Vec<Arc<StubCipher>>>,
}

impl StubSuite {
    /// Creates an empty suite.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { opened: Mutex::new(Vec::new()) })
    }

    /// Number of ciphers handed out so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.lock().len()
    }

    /// True when every cipher handed out has been closed.
    #[must_use]
    pub fn all_closed(&self) -> bool {
        self.lock().iter().all(|cipher| cipher.closed.load(Ordering::SeqCst))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<StubCipher>>> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CipherSuite for StubSuite {
    fn open(&self, _regex: &str, msg_len: usize) -> Result<Arc<dyn Cipher>> {
        if msg_len < LEN_DIGITS {
            return Err(Error::Cipher(format!("message length {msg_len} too small")));
        }
        let cipher = Arc::new(StubCipher { msg_len, closed: AtomicBool::new(false) });
        self.lock().push(Arc::clone(&cipher));
        Ok(cipher)
    }
}

/// One stub cipher for a fixed message length.
pub struct StubCipher {
    msg_len: usize,
    closed: AtomicBool,
}

impl Cipher for StubCipher {
    fn capacity(&self) -> usize {
        (self.msg_len - LEN_DIGITS) / 2
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > self.capacity() {
            return Err(Error::Cipher(format!(
                "plaintext {} exceeds capacity {}",
                plaintext.len(),
                self.capacity()
            )));
        }
        let mut out = String::with_capacity(self.msg_len);
        let _ = write!(out, "{:08x}", plaintext.len());
        for byte in plaintext {
            let _ = write!(out, "{byte:02x}");
        }
        while out.len() < self.msg_len {
            out.push('x');
        }
        Ok(out.into_bytes())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if ciphertext.len() < self.msg_len {
            return Ok(None);
        }
        let text = std::str::from_utf8(&ciphertext[..self.msg_len])
            .map_err(|_| Error::Cipher("message is not ascii".into()))?;
        let len = usize::from_str_radix(&text[..LEN_DIGITS], 16)
            .map_err(|_| Error::Cipher("unparseable message length".into()))?;
        if LEN_DIGITS + 2 * len > self.msg_len {
            return Err(Error::Cipher("declared length exceeds message".into()));
        }

        let mut plaintext = Vec::with_capacity(len);
        for i in 0..len {
            let offset = LEN_DIGITS + 2 * i;
            let byte = u8::from_str_radix(&text[offset..offset + 2], 16)
                .map_err(|_| Error::Cipher("unparseable message byte".into()))?;
            plaintext.push(byte);
        }
        Ok(Some((plaintext, self.msg_len)))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
