//! Encrypted framing for the TCP connector
//!
//! Both ends hold the same pre-shared key. A link starts with an X25519
//! exchange; the shared secret is run through HKDF-SHA256 salted with the
//! pre-shared key into one AES-256-GCM key per direction. Each side then
//! sends a sealed confirmation, so a wrong key fails the handshake instead
//! of the first data record.
//!
//! ```text
//! Initiator                                Responder
//!     │──── X25519 public (32B) ───────────────►│
//!     │◄─── X25519 public (32B) ────────────────│
//!     │──── record(CONFIRM) ───────────────────►│
//!     │◄─── record(CONFIRM) ────────────────────│
//!
//! record: ┌─────────────┬──────────────────────────┐
//!         │ Length (4B) │ ciphertext + 16B tag     │
//!         └─────────────┴──────────────────────────┘
//! ```
//!
//! Nonces are a per-direction counter, never reused within a link.

use std::io::{Read, Write};

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::digest;
use ring::hkdf;
use ring::rand::SystemRandom;

use super::ConnectorError;

/// Largest sealed record accepted from a peer
pub const MAX_RECORD_LEN: usize = 1 << 20;

const RECORD_HEADER_LEN: usize = 4;
const CONFIRM: &[u8] = b"netproxy-link-v1";
const INITIATOR_INFO: &[u8] = b"netproxy initiator";
const RESPONDER_INFO: &[u8] = b"netproxy responder";

/// Key shared by every NetProxy allowed to open encrypted links
#[derive(Clone, PartialEq, Eq)]
pub struct PreSharedKey([u8; 32]);

impl PreSharedKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        PreSharedKey(bytes)
    }

    /// SHA-256 of a passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        let d = digest::digest(&digest::SHA256, passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(d.as_ref());
        PreSharedKey(key)
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

fn nonce_for(counter: u64) -> Nonce {
    let mut n = [0u8; NONCE_LEN];
    n[NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
    Nonce::assume_unique_for_key(n)
}

// ============================================================================
// Sealing / Opening
// ============================================================================

pub struct Sealer {
    key: LessSafeKey,
    counter: u64,
}

impl Sealer {
    /// One framed record carrying `plaintext`
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let nonce = nonce_for(self.counter);
        self.counter = self.counter.checked_add(1).ok_or(ConnectorError::Crypto)?;

        let mut in_out = plaintext.to_vec();
        self.key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)?;
        if in_out.len() > MAX_RECORD_LEN {
            return Err(ConnectorError::Crypto);
        }
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + in_out.len());
        record.extend_from_slice(&(in_out.len() as u32).to_be_bytes());
        record.extend_from_slice(&in_out);
        Ok(record)
    }
}

pub struct Opener {
    key: LessSafeKey,
    counter: u64,
    buf: Vec<u8>,
}

impl Opener {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next decrypted record, `Ok(None)` until one is complete
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, ConnectorError> {
        if self.buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_RECORD_LEN || len < AES_256_GCM.tag_len() {
            return Err(ConnectorError::Crypto);
        }
        if self.buf.len() < RECORD_HEADER_LEN + len {
            return Ok(None);
        }
        let mut record: Vec<u8> = self.buf.drain(..RECORD_HEADER_LEN + len).skip(RECORD_HEADER_LEN).collect();

        let nonce = nonce_for(self.counter);
        self.counter = self.counter.checked_add(1).ok_or(ConnectorError::Crypto)?;
        let plain_len = self.key.open_in_place(nonce, Aad::empty(), &mut record)?.len();
        record.truncate(plain_len);
        Ok(Some(record))
    }
}

// ============================================================================
// Handshake
// ============================================================================

fn direction_key(prk: &hkdf::Prk, info: &[u8]) -> Result<LessSafeKey, ConnectorError> {
    Ok(LessSafeKey::new(UnboundKey::from(prk.expand(&[info], &AES_256_GCM)?)))
}

/// Run the key exchange on a fresh stream
///
/// The stream should carry a read timeout so a silent peer cannot stall
/// the caller.
pub fn handshake<S: Read + Write>(
    stream: &mut S,
    psk: &PreSharedKey,
    initiator: bool,
) -> Result<(Sealer, Opener), ConnectorError> {
    let rng = SystemRandom::new();
    let private = EphemeralPrivateKey::generate(&X25519, &rng)?;
    let public = private.compute_public_key()?;

    stream.write_all(public.as_ref())?;
    let mut peer_public = [0u8; 32];
    stream.read_exact(&mut peer_public)?;

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &psk.0);
    let (seal_key, open_key) = agreement::agree_ephemeral(
        private,
        &UnparsedPublicKey::new(&X25519, peer_public),
        |shared| -> Result<(LessSafeKey, LessSafeKey), ConnectorError> {
            let prk = salt.extract(shared);
            let initiator_key = direction_key(&prk, INITIATOR_INFO)?;
            let responder_key = direction_key(&prk, RESPONDER_INFO)?;
            Ok(if initiator {
                (initiator_key, responder_key)
            } else {
                (responder_key, initiator_key)
            })
        },
    )??;

    let mut sealer = Sealer {
        key: seal_key,
        counter: 0,
    };
    let mut opener = Opener {
        key: open_key,
        counter: 0,
        buf: Vec::new(),
    };

    stream.write_all(&sealer.seal(CONFIRM)?)?;
    let mut chunk = [0u8; 256];
    let confirm = loop {
        if let Some(record) = opener.next_record().map_err(|_| key_mismatch())? {
            break record;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(ConnectorError::Handshake("peer closed during handshake".into()));
        }
        opener.push(&chunk[..n]);
    };
    if confirm != CONFIRM {
        return Err(key_mismatch());
    }
    Ok((sealer, opener))
}

fn key_mismatch() -> ConnectorError {
    ConnectorError::Handshake("pre-shared key mismatch".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    type Keys = Result<(Sealer, Opener), ConnectorError>;

    fn pair(a: PreSharedKey, b: PreSharedKey) -> (Keys, Keys) {
        let (mut left, mut right) = UnixStream::pair().unwrap();
        left.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        right.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let responder = thread::spawn(move || handshake(&mut right, &b, false));
        let initiator = handshake(&mut left, &a, true);
        (initiator, responder.join().unwrap())
    }

    #[test]
    fn test_records_flow_both_ways() {
        let key = PreSharedKey::from_passphrase("shared secret");
        let (init, resp) = pair(key.clone(), key);
        let (mut i_seal, mut i_open) = init.unwrap();
        let (mut r_seal, mut r_open) = resp.unwrap();

        let r1 = i_seal.seal(b"hello").unwrap();
        let r2 = i_seal.seal(b"world").unwrap();
        // Deliver in pieces, as a stream would
        r_open.push(&r1[..3]);
        assert_eq!(r_open.next_record().unwrap(), None);
        r_open.push(&r1[3..]);
        r_open.push(&r2);
        assert_eq!(r_open.next_record().unwrap().unwrap(), b"hello");
        assert_eq!(r_open.next_record().unwrap().unwrap(), b"world");

        i_open.push(&r_seal.seal(b"back").unwrap());
        assert_eq!(i_open.next_record().unwrap().unwrap(), b"back");
    }

    #[test]
    fn test_wrong_key_fails_handshake() {
        let (init, resp) = pair(
            PreSharedKey::from_passphrase("one"),
            PreSharedKey::from_passphrase("two"),
        );
        assert!(matches!(init, Err(ConnectorError::Handshake(_))));
        assert!(matches!(resp, Err(ConnectorError::Handshake(_))));
    }

    #[test]
    fn test_tampered_record_rejected() {
        let key = PreSharedKey::new([7; 32]);
        let (init, resp) = pair(key.clone(), key);
        let (mut seal, _) = init.unwrap();
        let (_, mut open) = resp.unwrap();

        let mut record = seal.seal(b"payload").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;
        open.push(&record);
        assert!(matches!(open.next_record(), Err(ConnectorError::Crypto)));
    }
}
