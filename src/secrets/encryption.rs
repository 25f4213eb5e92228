//! Credential encryption: PBKDF2-derived AES-256-GCM keys.
//!
//! Every record gets a fresh 16-byte salt, so every record is sealed with its
//! own key derived from the master secret. The ciphertext layout is
//! `nonce(12) || ciphertext || tag(16)`.

use std::num::NonZeroU32;

use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use super::error::{Result, SecretsError};
use super::types::SecretString;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

/// Lower bound on PBKDF2 iterations
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Nonce sequence that yields exactly one nonce
struct OneShotNonce(Option<[u8; NONCE_SIZE]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
    }
}

/// Output of [`CredentialCipher::seal`]
#[derive(Clone)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Seals and opens credential plaintext under a master secret.
pub struct CredentialCipher {
    master: SecretString,
    iterations: NonZeroU32,
    rng: SystemRandom,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").field("iterations", &self.iterations).finish()
    }
}

impl CredentialCipher {
    pub fn new(master: SecretString, iterations: u32) -> Result<Self> {
        if master.is_empty() {
            return Err(SecretsError::master_key("Master secret cannot be empty"));
        }
        if iterations < MIN_PBKDF2_ITERATIONS {
            return Err(SecretsError::master_key(format!(
                "PBKDF2 iterations must be at least {}, got {}",
                MIN_PBKDF2_ITERATIONS, iterations
            )));
        }
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| SecretsError::master_key("PBKDF2 iterations must be non-zero"))?;

        Ok(Self { master, iterations, rng: SystemRandom::new() })
    }

    /// Read the master secret from an environment variable
    pub fn from_env(variable: &str, iterations: u32) -> Result<Self> {
        let master = std::env::var(variable).map_err(|_| {
            SecretsError::master_key(format!("{} environment variable not set", variable))
        })?;
        Self::new(SecretString::new(master), iterations)
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.iterations,
            salt,
            self.master.expose_secret().as_bytes(),
            &mut key[..],
        );
        key
    }

    fn random_bytes<const N: usize>(&self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| SecretsError::crypto("System random source unavailable"))?;
        Ok(bytes)
    }

    /// Encrypt `plaintext` under a fresh salt, binding `associated` as AAD.
    #[instrument(skip(self, plaintext, associated), fields(plaintext_len = plaintext.len()))]
    pub fn seal(&self, associated: &str, plaintext: &SecretString) -> Result<SealedSecret> {
        let salt: [u8; SALT_SIZE] = self.random_bytes()?;
        let nonce: [u8; NONCE_SIZE] = self.random_bytes()?;
        let key = self.derive_key(&salt);

        let unbound = UnboundKey::new(&AES_256_GCM, &key[..])
            .map_err(|_| SecretsError::crypto("Failed to create sealing key"))?;
        let mut sealing_key = aead::SealingKey::new(unbound, OneShotNonce(Some(nonce)));

        let mut in_out = Zeroizing::new(plaintext.expose_secret().as_bytes().to_vec());
        sealing_key
            .seal_in_place_append_tag(Aad::from(associated.as_bytes()), &mut *in_out)
            .map_err(|_| SecretsError::crypto("Failed to encrypt credential"))?;

        let mut ciphertext = Vec::with_capacity(NONCE_SIZE + in_out.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&in_out);

        debug!(ciphertext_len = ciphertext.len(), "Credential sealed");
        Ok(SealedSecret { ciphertext, salt: salt.to_vec() })
    }

    /// Decrypt a sealed credential. Fails if the AAD, salt or bytes differ.
    #[instrument(skip(self, ciphertext, salt, associated), fields(ciphertext_len = ciphertext.len()))]
    pub fn open(&self, associated: &str, ciphertext: &[u8], salt: &[u8]) -> Result<SecretString> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SecretsError::crypto("Ciphertext too short"));
        }
        if salt.len() != SALT_SIZE {
            return Err(SecretsError::crypto(format!(
                "Invalid salt length: expected {} bytes, got {}",
                SALT_SIZE,
                salt.len()
            )));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        let key = self.derive_key(salt);
        let unbound = UnboundKey::new(&AES_256_GCM, &key[..])
            .map_err(|_| SecretsError::crypto("Failed to create opening key"))?;
        let mut opening_key = aead::OpeningKey::new(unbound, OneShotNonce(Some(nonce)));

        let mut in_out = Zeroizing::new(sealed.to_vec());
        let plaintext = opening_key
            .open_in_place(Aad::from(associated.as_bytes()), &mut *in_out)
            .map_err(|_| SecretsError::crypto("Failed to decrypt credential"))?;

        let text = std::str::from_utf8(plaintext)
            .map_err(|_| SecretsError::crypto("Decrypted credential is not valid UTF-8"))?;
        Ok(SecretString::new(text))
    }
}
