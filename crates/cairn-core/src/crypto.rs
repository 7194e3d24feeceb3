//! Cryptographic primitives for Cairn.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: content hashes, discovery session ids, peer ids
//!   2. Ed25519 keypairs: every protocol message is signed with one
//!   3. PeerId: the stable node identifier, derived from the public key
//!
//! Secret key material is zeroized on drop. There is no unsafe code in this
//! module.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use cairn_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, cairn_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── PeerId ────────────────────────────────────────────────────────────────────

/// Stable node identifier: BLAKE3 of the node's Ed25519 public key.
///
/// Any message claiming a sender id must carry a public key that hashes to
/// that id, otherwise verification fails.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the peer id for a public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        PeerId(hash(public_key))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes as hex. Used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidPeerId(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPeerId(s.to_string()))?;
        Ok(PeerId(arr))
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 keypair.
///
/// Generated once per node and stored persistently. The public key travels in
/// every message envelope. The secret key never leaves this struct except
/// through [`Keypair::secret_bytes`] for persistence.
pub struct Keypair {
    signing: SigningKey,
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct a keypair from stored secret key bytes.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = Zeroizing::new(secret);
        Self::from_signing_key(SigningKey::from_bytes(&secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let peer_id = PeerId::from_public_key(signing.verifying_key().as_bytes());
        Self { signing, peer_id }
    }

    /// Serialize the secret key for persistent storage.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sign arbitrary bytes. Returns the 64-byte Ed25519 signature.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    /// Load the keypair at `path`, or generate and write one (mode 0600).
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let bytes = Zeroizing::new(
                std::fs::read(path).map_err(|e| IdentityError::Read(path.to_path_buf(), e))?,
            );
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::Malformed(path.to_path_buf()))?;
            return Ok(Self::from_secret(secret));
        }

        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IdentityError::Write(path.to_path_buf(), e))?;
        }
        write_secret(path, &keypair.secret_bytes()[..])
            .map_err(|e| IdentityError::Write(path.to_path_buf(), e))?;
        Ok(keypair)
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, secret: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(secret)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_secret(path: &Path, secret: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, secret)
}

/// Check an Ed25519 signature. Any malformed input is simply `false`.
pub fn verify_signature(public_key: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    let key = match VerifyingKey::from_bytes(public_key) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    key.verify(data, &Signature::from_bytes(&sig_bytes)).is_ok()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("failed to read keypair {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),
    #[error("failed to write keypair {0}: {1}")]
    Write(std::path::PathBuf, std::io::Error),
    #[error("keypair file {0} is not a 32-byte secret key")]
    Malformed(std::path::PathBuf),
}
