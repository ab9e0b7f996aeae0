//! Peer identity: X25519 keypairs and preshared keys, base64 canonical encoding.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of every key kind: X25519 scalars and preshared keys alike.
pub const KEY_LEN: usize = 32;

mod b64_32 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        BASE64.encode(v).serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let buf = BASE64
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 key bytes"))
    }
}

fn decode_key32(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(s.as_bytes()).map_err(|_| KeyError::InvalidKey)?;
    bytes.try_into().map_err(|_| KeyError::InvalidKey)
}

/// X25519 public key (32 bytes). Serializes as base64.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "b64_32")] [u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        PublicKey(bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key32(s).map(PublicKey)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, KeyError> {
        Self::from_base64(s)
    }
}

/// X25519 private key (32 bytes). The matching public key is a pure function
/// of this value; see [`PrivateKey::public_key`].
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrivateKey(#[serde(with = "b64_32")] [u8; KEY_LEN]);

impl PrivateKey {
    /// Generate a fresh random private key.
    pub fn generate() -> Self {
        PrivateKey(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Derive the public key. Deterministic: same input, same output.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(X25519PublicKey::from(&secret).to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        PrivateKey(bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key32(s).map(PrivateKey)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

// Keep secret bytes out of debug output.
impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Symmetric 32-byte key. Generated like a private key but never paired with
/// a derived public key.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PresharedKey(#[serde(with = "b64_32")] [u8; KEY_LEN]);

impl PresharedKey {
    pub fn generate() -> Self {
        PresharedKey(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        PresharedKey(bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key32(s).map(PresharedKey)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(..)")
    }
}

/// A private key and its derived public key.
#[derive(Clone)]
pub struct Keypair {
    private: PrivateKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn into_parts(self) -> (PrivateKey, PublicKey) {
        (self.private, self.public)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("key material is not base64 of a 32-byte scalar")]
    InvalidKey,
    #[error("public key does not match private key")]
    Mismatch,
}
