//! Cryptographic primitives for the Parley handshake and transport.
//!
//! Two ciphers appear on the wire. AES-256-CBC with PKCS#7 padding protects
//! all post-handshake traffic under a per-session key; RSA PKCS#1 v1.5 is
//! used exactly once per connection, to wrap the AES key on its way to the
//! server. The server keypair is generated once at process start and only
//! its public half ever leaves the process.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::error::{ProtocolError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES key length in bytes (AES-256).
pub const AES_KEY_SIZE: usize = 32;

/// AES block / IV length in bytes.
pub const AES_IV_SIZE: usize = 16;

/// Default RSA modulus size for the server identity keypair.
pub const RSA_KEY_BITS: usize = 2048;

/// A 256-bit AES session key.
///
/// Generated fresh by the client for every connection and handed to the
/// server inside the RSA-wrapped `sendaes` message.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; AES_KEY_SIZE]);

impl AesKey {
    /// Generate a fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Build a key from raw bytes, rejecting wrong lengths.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; AES_KEY_SIZE] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidKey(format!(
                "aes key must be {AES_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Decode a key from its base64 wire form.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| ProtocolError::InvalidKey(format!("bad base64 aes key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Encode the key for transport inside a `sendaes` message.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    // Never print key bytes in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// Encrypt a payload under AES-256-CBC with a fresh random IV.
///
/// Output layout is `IV(16) || ciphertext`, matching the wire format for
/// AES-mode frames. The IV is never reused across messages.
pub fn aes_encrypt(key: &AesKey, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; AES_IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&key.0.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(AES_IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt an `IV(16) || ciphertext` payload under AES-256-CBC.
pub fn aes_decrypt(key: &AesKey, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < AES_IV_SIZE {
        return Err(ProtocolError::DecryptionFailure(format!(
            "aes payload too short to carry an iv: {} bytes",
            payload.len()
        )));
    }
    let (iv, ciphertext) = payload.split_at(AES_IV_SIZE);

    Aes256CbcDec::new_from_slices(&key.0, iv)
        .map_err(|e| ProtocolError::DecryptionFailure(format!("bad iv: {e}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| ProtocolError::DecryptionFailure(format!("bad padding or ciphertext: {e}")))
}

/// The process-wide RSA identity keypair.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl RsaKeyPair {
    /// Generate a keypair with the given modulus size.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?;
        let public_der = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .map_err(|e| ProtocolError::KeyGeneration(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    /// PKCS#1 DER encoding of the public half, as distributed in `sendrsa`.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// The private half, used to unwrap RSA-mode frames.
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("public_der_len", &self.public_der.len())
            .finish_non_exhaustive()
    }
}

/// Encrypt a payload to a peer's PKCS#1 DER public key (PKCS#1 v1.5 padding).
///
/// Only the handshake `sendaes` message uses this path; the plaintext must
/// fit inside a single RSA block for the peer's modulus.
pub fn rsa_encrypt(public_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let public = RsaPublicKey::from_pkcs1_der(public_key_der)
        .map_err(|e| ProtocolError::InvalidKey(format!("bad rsa public key der: {e}")))?;
    Ok(public.encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)?)
}

/// Decrypt a single RSA-mode block with the process keypair.
pub fn rsa_decrypt(private: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    private
        .decrypt(Pkcs1v15Encrypt, ciphertext)
        .map_err(|e| ProtocolError::DecryptionFailure(e.to_string()))
}
