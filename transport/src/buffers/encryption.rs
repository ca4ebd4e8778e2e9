use std::fmt::{Debug, Formatter};
use aead::{AeadInPlace, Key, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use anyhow::bail;
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, trace};
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// number of bytes that encryption adds to a message
pub const ENCRYPTION_OVERHEAD: usize = TAG_LEN + NONCE_LEN;
pub const PUBLIC_KEY_LEN: usize = 32;

/// Encryption of application messages. This is applied to a message as a whole before it is
///  fragmented, and removed after reassembly.
pub trait MessageCipher: Send + Sync {
    fn encrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn decrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()>;
}

pub struct NoEncryption;
impl MessageCipher for NoEncryption {
    fn encrypt_buffer(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }

    fn decrypt_buffer(&self, _buf: &mut BytesMut) -> anyhow::Result<()> {
        Ok(())
    }
}

/// AES-256-GCM with the nonce appended to the ciphertext:
///
/// ```ascii
/// 0: ciphertext (plaintext length + 16 bytes tag)
/// *: nonce (12 bytes): 4 random bytes fixed per cipher instance, 8 bytes counter
/// ```
pub struct Aes256GcmEncryption {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmEncryption {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);

        Aes256GcmEncryption {
            cipher: Aes256Gcm::new(key),
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(rand::random()),
        }
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut buf = [0u8; NONCE_LEN];
        buf[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        buf[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&buf)
    }
}

impl MessageCipher for Aes256GcmEncryption {
    fn encrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let nonce = self.unique_nonce();

        if self.cipher.encrypt_in_place(&nonce, b"", buf).is_err() {
            error!("error encrypting buffer");
            bail!("error encrypting buffer");
        }

        buf.extend_from_slice(nonce.as_slice());
        trace!("encrypted message to {} bytes", buf.len());
        Ok(())
    }

    fn decrypt_buffer(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if buf.len() < NONCE_LEN {
            bail!("received buffer too short");
        }

        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf[buf.len() - NONCE_LEN..]);
        buf.truncate(buf.len() - NONCE_LEN);
        if self.cipher.decrypt_in_place(&nonce, b"", buf).is_err() {
            bail!("decryption error");
        }
        Ok(())
    }
}

/// One side of an X25519 key exchange. Each side sends its public key during the handshake, and
///  the session key is the SHA-256 hash of the shared secret.
pub struct KeyAgreement {
    secret: StaticSecret,
    public_key: PublicKey,
}

impl Debug for KeyAgreement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyAgreement({:?})", &self.public_key.as_bytes()[..4])
    }
}

impl KeyAgreement {
    pub fn new() -> KeyAgreement {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let public_key = PublicKey::from(&secret);
        KeyAgreement {
            secret,
            public_key,
        }
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.public_key.as_bytes()
    }

    pub fn session_cipher(&self, peer_public_key: &[u8]) -> anyhow::Result<Aes256GcmEncryption> {
        let peer_public_key: [u8; PUBLIC_KEY_LEN] = match peer_public_key.try_into() {
            Ok(key) => key,
            Err(_) => bail!("peer public key has length {}, expected {}", peer_public_key.len(), PUBLIC_KEY_LEN),
        };

        let shared = self.secret.diffie_hellman(&PublicKey::from(peer_public_key));
        let session_key: [u8; 32] = Sha256::digest(shared.as_bytes()).into();
        Ok(Aes256GcmEncryption::new(&session_key))
    }
}
