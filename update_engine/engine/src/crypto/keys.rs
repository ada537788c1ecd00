//! ECU key material. Private keys never leave `EcuKey`; public keys travel as hex.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::UpdateError;

/// Ed25519 public key of an ECU, Primary, or time server.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UpdateError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UpdateError::Schema(format!("public key must be 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|e| UpdateError::Schema(format!("invalid public key: {e}")))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, UpdateError> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| UpdateError::Schema(format!("public key is not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Hex SHA-256 of the raw public key.
    pub fn keyid(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, signature).is_ok()
    }

    /// Reads a hex public key file written by [`EcuKey::load_or_generate`].
    pub fn load(path: &Path) -> Result<Self, UpdateError> {
        Self::from_hex(&fs::read_to_string(path)?)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.keyid()[..12])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        PublicKey::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Private signing key held by one ECU.
pub struct EcuKey {
    signing: SigningKey,
}

impl EcuKey {
    pub fn generate() -> Self {
        EcuKey {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_hex(encoded: &str) -> Result<Self, UpdateError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| UpdateError::Config(format!("private key is not hex: {e}")))?,
        );
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            UpdateError::Config(format!("private key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(EcuKey {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    /// Loads the key stored at `path`, or generates and writes a fresh pair
    /// (`path` and `path.pub`) when it is missing or `use_new_key` is set.
    pub fn load_or_generate(path: &Path, use_new_key: bool) -> Result<Self, UpdateError> {
        if !use_new_key && path.exists() {
            let encoded = Zeroizing::new(fs::read_to_string(path)?);
            return Self::from_secret_hex(&encoded);
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let secret = Zeroizing::new(hex::encode(key.signing.to_bytes()));
        fs::write(path, secret.as_bytes())?;
        fs::write(public_key_path(path), key.public_key().to_hex())?;
        info!(path = %path.display(), keyid = %key.keyid(), "generated new ECU key");
        Ok(key)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn keyid(&self) -> String {
        self.public_key().keyid()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for EcuKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcuKey").field("keyid", &self.keyid()).finish()
    }
}

/// `keys/primary` -> `keys/primary.pub`
pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}
