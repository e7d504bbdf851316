//! Operator signing keys: generation, storage, and the passphrase envelope.
//!
//! The private key lives at `keys/<name>.key` (mode 0600) as PKCS#8 PEM,
//! either plaintext or sealed in an AEAD envelope when the operator supplies
//! a passphrase. The public key lives at `keys/<name>.pub` (mode 0644).
//!
//! Envelope format: `QENC1:<salt>:<iv>:<tag>:<ciphertext>` with all fields
//! hex-encoded. AES-256-GCM, 12-byte IV, 16-byte tag; the 32-byte key is
//! derived from the passphrase with scrypt (log2 N = 14, r = 8, p = 1).

use crate::{sha256_hex, QuillError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};

/// Magic prefix marking an encrypted private-key envelope.
const ENVELOPE_MAGIC: &str = "QENC1";

/// AES-GCM IV length in bytes.
const IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// Salt length for the scrypt derivation.
const SALT_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Operator keys
// ---------------------------------------------------------------------------

/// An Ed25519 keypair held in memory for signing audit records.
pub struct OperatorKeys {
    signing: SigningKey,
    /// SPKI PEM of the public key, embedded verbatim into every record.
    pub public_key_pem: String,
}

impl OperatorKeys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Result<Self> {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Result<Self> {
        let public_key_pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| QuillError::Crypto(format!("encode public key: {e}")))?;
        Ok(Self {
            signing,
            public_key_pem,
        })
    }

    /// Parse from a PKCS#8 private-key PEM.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| QuillError::Crypto(format!("parse private key PEM: {e}")))?;
        Self::from_signing_key(signing)
    }

    /// PKCS#8 PEM of the private key.
    pub fn private_pem(&self) -> Result<String> {
        let pem = self
            .signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| QuillError::Crypto(format!("encode private key: {e}")))?;
        Ok(pem.to_string())
    }

    /// Sign a message, returning the signature hex-encoded.
    pub fn sign_hex(&self, message: &str) -> String {
        hex::encode(self.signing.sign(message.as_bytes()).to_bytes())
    }

    /// Short fingerprint of this keypair's public key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_pem)
    }
}

/// Verify a hex Ed25519 signature against a public-key PEM.
pub fn verify_hex(public_key_pem: &str, message: &str, signature_hex: &str) -> Result<bool> {
    let verifying = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| QuillError::Crypto(format!("parse public key PEM: {e}")))?;
    let bytes = hex::decode(signature_hex)
        .map_err(|e| QuillError::Crypto(format!("decode signature hex: {e}")))?;
    let sig_bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| QuillError::Crypto("signature is not 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(verifying
        .verify_strict(message.as_bytes(), &signature)
        .is_ok())
}

/// First 16 hex characters of SHA-256 over the PEM body (headers, footers,
/// and whitespace stripped), used as a short stable key identifier.
pub fn fingerprint(public_key_pem: &str) -> String {
    let body: String = public_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    sha256_hex(body.as_bytes())[..16].to_string()
}

// ---------------------------------------------------------------------------
// Passphrase envelope
// ---------------------------------------------------------------------------

/// Failure modes of envelope opening that callers must tell apart.
#[derive(Debug)]
enum EnvelopeError {
    /// AEAD tag mismatch: the passphrase is wrong (or the ciphertext was
    /// modified, which is indistinguishable by construction).
    WrongPassphrase,
    /// The envelope structure itself is invalid.
    Malformed(String),
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let params = scrypt::Params::new(14, 8, 1, 32)
        .map_err(|e| QuillError::Crypto(format!("scrypt params: {e}")))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key)
        .map_err(|e| QuillError::Crypto(format!("scrypt derive: {e}")))?;
    Ok(key)
}

/// Seal a private-key PEM under a passphrase.
fn seal_envelope(plaintext: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| QuillError::Crypto(format!("cipher init: {e}")))?;
    let sealed = cipher
        .encrypt(AesNonce::from_slice(&iv), plaintext)
        .map_err(|e| QuillError::Crypto(format!("seal envelope: {e}")))?;

    // aes-gcm appends the tag to the ciphertext; the envelope stores it as
    // its own field.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
    Ok(format!(
        "{ENVELOPE_MAGIC}:{}:{}:{}:{}",
        hex::encode(salt),
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

fn open_envelope(envelope: &str, passphrase: &str) -> Result<std::result::Result<Vec<u8>, EnvelopeError>> {
    let parts: Vec<&str> = envelope.trim().split(':').collect();
    if parts.len() != 5 || parts[0] != ENVELOPE_MAGIC {
        return Ok(Err(EnvelopeError::Malformed(
            "expected QENC1:salt:iv:tag:ciphertext".to_string(),
        )));
    }
    let decode = |field: &str, name: &str| -> std::result::Result<Vec<u8>, EnvelopeError> {
        hex::decode(field).map_err(|e| EnvelopeError::Malformed(format!("bad {name} hex: {e}")))
    };
    let (salt, iv, tag, ciphertext) = match (
        decode(parts[1], "salt"),
        decode(parts[2], "iv"),
        decode(parts[3], "tag"),
        decode(parts[4], "ciphertext"),
    ) {
        (Ok(s), Ok(i), Ok(t), Ok(c)) => (s, i, t, c),
        (Err(e), ..) | (_, Err(e), ..) | (_, _, Err(e), _) | (_, _, _, Err(e)) => {
            return Ok(Err(e))
        }
    };
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Ok(Err(EnvelopeError::Malformed(format!(
            "iv must be {IV_LEN} bytes and tag {TAG_LEN} bytes"
        ))));
    }

    let key = derive_key(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| QuillError::Crypto(format!("cipher init: {e}")))?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);
    match cipher.decrypt(AesNonce::from_slice(&iv), sealed.as_ref()) {
        Ok(plaintext) => Ok(Ok(plaintext)),
        // AEAD failure cannot distinguish wrong key from tampering; the
        // operator-facing meaning is "wrong passphrase".
        Err(_) => Ok(Err(EnvelopeError::WrongPassphrase)),
    }
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

/// Result of attempting to load the operator key from disk.
pub enum KeyLoad {
    /// Key material loaded and ready for signing.
    Loaded(OperatorKeys),
    /// No key file exists yet; the caller should generate one.
    Absent,
    /// The key is enveloped and no passphrase was supplied.
    NeedsPassphrase,
    /// The key is enveloped and the supplied passphrase failed AEAD
    /// verification.
    BadPassphrase,
}

/// On-disk keystore rooted at `<data_dir>/keys`.
pub struct Keystore {
    dir: PathBuf,
    name: String,
}

impl Keystore {
    pub fn new(data_dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self {
            dir: data_dir.as_ref().join("keys"),
            name: name.into(),
        }
    }

    /// Path to the private-key file.
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key", self.name))
    }

    /// Path to the public-key file.
    pub fn pub_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", self.name))
    }

    /// Generate a fresh keypair and persist it.
    ///
    /// With a passphrase the private key is sealed in the AEAD envelope;
    /// without one it is written as plaintext PEM. File modes are 0600 for
    /// the private key and 0644 for the public key.
    pub fn generate(&self, passphrase: Option<&str>) -> Result<OperatorKeys> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| QuillError::Keystore(format!("create {}: {e}", self.dir.display())))?;

        let keys = OperatorKeys::generate()?;
        let private_pem = keys.private_pem()?;
        let key_contents = match passphrase {
            Some(phrase) => seal_envelope(private_pem.as_bytes(), phrase)?,
            None => private_pem,
        };

        write_with_mode(&self.key_path(), key_contents.as_bytes(), 0o600)?;
        write_with_mode(&self.pub_path(), keys.public_key_pem.as_bytes(), 0o644)?;
        Ok(keys)
    }

    /// Load the operator key, distinguishing the failure modes the relay
    /// must report separately at startup.
    pub fn load(&self, passphrase: Option<&str>) -> Result<KeyLoad> {
        let path = self.key_path();
        if !path.exists() {
            return Ok(KeyLoad::Absent);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| QuillError::Keystore(format!("read {}: {e}", path.display())))?;

        if contents.trim_start().starts_with(ENVELOPE_MAGIC) {
            let Some(phrase) = passphrase else {
                return Ok(KeyLoad::NeedsPassphrase);
            };
            return match open_envelope(&contents, phrase)? {
                Ok(plaintext) => {
                    let pem = String::from_utf8(plaintext).map_err(|_| {
                        QuillError::Keystore("decrypted key is not valid UTF-8".to_string())
                    })?;
                    Ok(KeyLoad::Loaded(OperatorKeys::from_private_pem(&pem)?))
                }
                Err(EnvelopeError::WrongPassphrase) => Ok(KeyLoad::BadPassphrase),
                Err(EnvelopeError::Malformed(reason)) => Err(QuillError::Keystore(format!(
                    "malformed key envelope in {}: {reason}",
                    path.display()
                ))),
            };
        }

        Ok(KeyLoad::Loaded(OperatorKeys::from_private_pem(&contents)?))
    }

}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    std::fs::write(path, contents)
        .map_err(|e| QuillError::Keystore(format!("write {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| QuillError::Keystore(format!("chmod {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
