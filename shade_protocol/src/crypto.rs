// Session ciphers and handshake key derivation.
//
// Every frame body is sealed with an AEAD cipher. Before the handshake the
// cipher key comes from the router's pre-shared password alone
// (`SessionCipher::from_password`); the handshake then replaces it with a
// key derived from an X25519 exchange:
//
//   okm_0 = shared secret
//   okm_i = HKDF(hash, salt, ikm = okm_{i-1}, info = password)   i = 1..=iterations
//
// so the negotiated key still depends on the password, and a client that
// does not know it cannot talk to the router even after key agreement.
//
// Cipher, key size, hash, iteration count and salt are chosen by the client
// and validated here. Sealed output is `nonce (12 bytes) || ciphertext`.

use std::fmt;

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Nonce size shared by every supported cipher.
pub const NONCE_SIZE: usize = 12;

/// AEAD tag size shared by every supported cipher.
const TAG_SIZE: usize = 16;

/// Upper bound on the client-chosen iteration count.
pub const MAX_ITERATIONS: u32 = 4096;

/// Upper bound on the client-chosen salt.
pub const MAX_SALT_SIZE: usize = 64;

const PASSWORD_SALT: &[u8] = b"shade-router-password-v1";
const PASSWORD_INFO: &[u8] = b"shade-router-transport";

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unsupported key size {key_size} for {cipher:?}")]
    KeySize { cipher: CipherKind, key_size: u32 },

    #[error("iteration count {0} out of range (1..={max})", max = MAX_ITERATIONS)]
    Iterations(u32),

    #[error("salt too large: {0} bytes (max {max})", max = MAX_SALT_SIZE)]
    SaltSize(usize),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("ciphertext too short")]
    CiphertextTooShort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
}

impl CipherKind {
    /// Key size in bits this cipher requires.
    pub fn key_bits(self) -> u32 {
        match self {
            CipherKind::ChaCha20Poly1305 | CipherKind::Aes256Gcm => 256,
            CipherKind::Aes128Gcm => 128,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashKind {
    Sha256,
    Sha512,
}

/// Client-selected parameters for turning a shared secret into a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyParams {
    pub cipher: CipherKind,
    pub key_size: u32,
    pub hash: HashKind,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl KeyParams {
    /// Reject parameter combinations the router will not negotiate.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.key_size != self.cipher.key_bits() {
            return Err(CryptoError::KeySize {
                cipher: self.cipher,
                key_size: self.key_size,
            });
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(CryptoError::Iterations(self.iterations));
        }
        if self.salt.len() > MAX_SALT_SIZE {
            return Err(CryptoError::SaltSize(self.salt.len()));
        }
        Ok(())
    }
}

impl Default for KeyParams {
    fn default() -> Self {
        Self {
            cipher: CipherKind::ChaCha20Poly1305,
            key_size: 256,
            hash: HashKind::Sha256,
            iterations: 16,
            salt: Vec::new(),
        }
    }
}

#[derive(Clone)]
enum Engine {
    ChaCha(ChaCha20Poly1305),
    Aes256(Aes256Gcm),
    Aes128(Aes128Gcm),
}

/// An AEAD cipher bound to one key.
#[derive(Clone)]
pub struct SessionCipher {
    kind: CipherKind,
    engine: Engine,
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SessionCipher {
    /// Build a cipher of `kind` from raw key bytes.
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        let bad_size = || CryptoError::KeySize {
            cipher: kind,
            key_size: (key.len() * 8) as u32,
        };
        let engine = match kind {
            CipherKind::ChaCha20Poly1305 => {
                Engine::ChaCha(ChaCha20Poly1305::new_from_slice(key).map_err(|_| bad_size())?)
            }
            CipherKind::Aes256Gcm => {
                Engine::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| bad_size())?)
            }
            CipherKind::Aes128Gcm => {
                Engine::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| bad_size())?)
            }
        };
        Ok(Self { kind, engine })
    }

    /// The pre-handshake cipher every client of a router shares.
    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; 32];
        // A 32-byte output is always within HKDF-SHA256's limit.
        let _ = Hkdf::<Sha256>::new(Some(PASSWORD_SALT), password.as_bytes())
            .expand(PASSWORD_INFO, &mut key);
        Self {
            kind: CipherKind::ChaCha20Poly1305,
            engine: Engine::ChaCha(ChaCha20Poly1305::new(GenericArray::from_slice(&key))),
        }
    }

    /// Derive the negotiated session cipher from a key-agreement secret.
    pub fn derive(
        shared_secret: &[u8],
        password: &str,
        params: &KeyParams,
    ) -> Result<Self, CryptoError> {
        params.validate()?;
        let key = stretch(shared_secret, password.as_bytes(), params)?;
        Self::new(params.cipher, &key)
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Seal `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let nonce_ref = GenericArray::from_slice(&nonce);
        let ciphertext = match &self.engine {
            Engine::ChaCha(c) => c.encrypt(nonce_ref, plaintext),
            Engine::Aes256(c) => c.encrypt(nonce_ref, plaintext),
            Engine::Aes128(c) => c.encrypt(nonce_ref, plaintext),
        }
        .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a buffer produced by `encrypt`.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = GenericArray::from_slice(nonce);
        match &self.engine {
            Engine::ChaCha(c) => c.decrypt(nonce, ciphertext),
            Engine::Aes256(c) => c.decrypt(nonce, ciphertext),
            Engine::Aes128(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CryptoError::Decrypt)
    }
}

fn stretch(shared_secret: &[u8], info: &[u8], params: &KeyParams) -> Result<Vec<u8>, CryptoError> {
    let mut ikm = shared_secret.to_vec();
    let mut okm = vec![0u8; (params.key_size / 8) as usize];
    for _ in 0..params.iterations {
        match params.hash {
            HashKind::Sha256 => Hkdf::<Sha256>::new(Some(&params.salt), &ikm).expand(info, &mut okm),
            HashKind::Sha512 => Hkdf::<Sha512>::new(Some(&params.salt), &ikm).expand(info, &mut okm),
        }
        .map_err(|_| CryptoError::KeyDerivation)?;
        ikm.clone_from(&okm);
    }
    Ok(okm)
}

/// One side of an X25519 key agreement.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consume the secret and compute the shared secret with `peer`.
    pub fn agree(self, peer: [u8; 32]) -> [u8; 32] {
        self.secret.diffie_hellman(&PublicKey::from(peer)).to_bytes()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(cipher: CipherKind, hash: HashKind) -> KeyParams {
        KeyParams {
            cipher,
            key_size: cipher.key_bits(),
            hash,
            iterations: 4,
            salt: b"salt".to_vec(),
        }
    }

    #[test]
    fn password_cipher_roundtrip() {
        let a = SessionCipher::from_password("hunter2");
        let b = SessionCipher::from_password("hunter2");
        let sealed = a.encrypt(b"hello").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn wrong_password_fails() {
        let sealed = SessionCipher::from_password("right").encrypt(b"x").unwrap();
        let result = SessionCipher::from_password("wrong").decrypt(&sealed);
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[test]
    fn key_agreement_yields_matching_ciphers() {
        for (cipher, hash) in [
            (CipherKind::ChaCha20Poly1305, HashKind::Sha256),
            (CipherKind::Aes256Gcm, HashKind::Sha512),
            (CipherKind::Aes128Gcm, HashKind::Sha256),
        ] {
            let client = KeyExchange::new();
            let router = KeyExchange::new();
            let client_pub = client.public_key();
            let router_pub = router.public_key();

            let p = params(cipher, hash);
            let client_cipher = SessionCipher::derive(&client.agree(router_pub), "pw", &p).unwrap();
            let router_cipher = SessionCipher::derive(&router.agree(client_pub), "pw", &p).unwrap();

            let sealed = client_cipher.encrypt(b"payload").unwrap();
            assert_eq!(router_cipher.decrypt(&sealed).unwrap(), b"payload");
            assert_eq!(router_cipher.kind(), cipher);
        }
    }

    #[test]
    fn derived_key_depends_on_password() {
        let secret = [7u8; 32];
        let p = params(CipherKind::ChaCha20Poly1305, HashKind::Sha256);
        let a = SessionCipher::derive(&secret, "one", &p).unwrap();
        let b = SessionCipher::derive(&secret, "two", &p).unwrap();
        let sealed = a.encrypt(b"x").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_mismatched_key_size() {
        let p = KeyParams {
            key_size: 128,
            ..KeyParams::default()
        };
        assert!(matches!(p.validate(), Err(CryptoError::KeySize { .. })));
    }

    #[test]
    fn rejects_iteration_bounds() {
        let zero = KeyParams {
            iterations: 0,
            ..KeyParams::default()
        };
        let huge = KeyParams {
            iterations: MAX_ITERATIONS + 1,
            ..KeyParams::default()
        };
        assert!(matches!(zero.validate(), Err(CryptoError::Iterations(0))));
        assert!(huge.validate().is_err());
    }

    #[test]
    fn rejects_large_salt() {
        let p = KeyParams {
            salt: vec![0; MAX_SALT_SIZE + 1],
            ..KeyParams::default()
        };
        assert!(matches!(p.validate(), Err(CryptoError::SaltSize(_))));
    }

    #[test]
    fn short_ciphertext_rejected() {
        let cipher = SessionCipher::from_password("pw");
        assert!(matches!(
            cipher.decrypt(&[0u8; 10]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }
}
