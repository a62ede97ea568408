//! Lokale Identität (Ed25519)
//!
//! Bindet eine Benutzer-ID an ein Schlüsselpaar. Der Signaling-Server
//! kennt nur den Public Key, der Private Key bleibt auf dem Gerät.
//!
//! ## Verwendung
//! ```rust,ignore
//! let identity = LocalIdentity::load_or_create("alice")?;
//! let signature = identity.sign_message(&payload);
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to access key directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode private key: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid private key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// LOCAL IDENTITY
// ============================================================================

/// Benutzer-ID plus Ed25519 Schlüssel
#[derive(Clone)]
pub struct LocalIdentity {
    user_id: String,
    signing_key: SigningKey,
}

impl LocalIdentity {
    /// Lädt den Schlüssel des Benutzers aus dem App-Datenverzeichnis oder
    /// erstellt einen neuen
    pub fn load_or_create(user_id: &str) -> Result<Self, IdentityError> {
        let proj_dirs = directories::ProjectDirs::from("dev", "devverse", "devverse-voice")
            .ok_or(IdentityError::NoDataDir)?;

        let mut dir = proj_dirs.data_dir().to_path_buf();
        dir.push("keys");
        Self::load_or_create_in(&dir, user_id)
    }

    /// Wie `load_or_create`, aber mit explizitem Schlüsselverzeichnis
    pub fn load_or_create_in(dir: &Path, user_id: &str) -> Result<Self, IdentityError> {
        let key_path = Self::key_path(dir, user_id);

        if key_path.exists() {
            tracing::info!("Loading identity for {} from {:?}", user_id, key_path);
            let signing_key = Self::load_key(&key_path)?;
            Ok(Self {
                user_id: user_id.to_string(),
                signing_key,
            })
        } else {
            tracing::info!("Creating identity for {} at {:?}", user_id, key_path);
            let identity = Self::generate(user_id);
            identity.save_key(&key_path)?;
            Ok(identity)
        }
    }

    /// Neue flüchtige Identität (nicht gespeichert)
    pub fn generate(user_id: &str) -> Self {
        let mut csprng = OsRng;
        Self {
            user_id: user_id.to_string(),
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Public Key als Base64 (44 Zeichen)
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signiert eine JSON-Nachricht für den Signaling-Server
    ///
    /// Signiert wird der JSON-String mit alphabetisch sortierten Keys,
    /// ein vorhandenes `signature`-Feld wird ignoriert.
    pub fn sign_message(&self, payload: &serde_json::Value) -> String {
        let canonical = canonical_json(payload);
        let signature: Signature = self.signing_key.sign(canonical.as_bytes());
        BASE64.encode(signature.to_bytes())
    }

    fn key_path(dir: &Path, user_id: &str) -> PathBuf {
        // Benutzer-IDs kommen vom Auth-Provider, nicht jedes Zeichen taugt als Dateiname
        let file_stem: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        dir.join(format!("{}.key", file_stem))
    }

    fn load_key(path: &Path) -> Result<SigningKey, IdentityError> {
        let encoded = fs::read_to_string(path)?;
        let bytes = BASE64.decode(encoded.trim())?;

        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength(bytes.len()))?;

        Ok(SigningKey::from_bytes(&key_bytes))
    }

    fn save_key(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("user_id", &self.user_id)
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Prüft eine Signatur, wie sie `sign_message` erzeugt
pub fn verify_message(public_key_base64: &str, payload: &serde_json::Value, signature: &str) -> bool {
    let Ok(key_bytes) = BASE64.decode(public_key_base64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };

    verifying_key
        .verify(canonical_json(payload).as_bytes(), &signature)
        .is_ok()
}

/// JSON mit rekursiv sortierten Keys, ohne `signature`
fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

fn sorted(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().filter(|k| *k != "signature").collect();
            keys.sort();

            let mut out = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    out.insert(key.clone(), sorted(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sorted).collect())
        }
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_length() {
        let identity = LocalIdentity::generate("alice");
        // 32 bytes = 44 Zeichen Base64
        assert_eq!(identity.public_key_base64().len(), 44);
        assert_eq!(identity.user_id(), "alice");
    }

    #[test]
    fn test_sign_and_verify_ignores_key_order_and_signature() {
        let identity = LocalIdentity::generate("alice");

        let payload = serde_json::json!({
            "type": "register",
            "peerId": "alice",
            "timestamp": 1234567890
        });
        let signature = identity.sign_message(&payload);

        let reordered = serde_json::json!({
            "timestamp": 1234567890,
            "peerId": "alice",
            "type": "register",
            "signature": signature.clone()
        });

        assert!(verify_message(&identity.public_key_base64(), &reordered, &signature));
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let identity = LocalIdentity::generate("alice");
        let payload = serde_json::json!({ "type": "hangup", "callId": "a" });
        let signature = identity.sign_message(&payload);

        let tampered = serde_json::json!({ "type": "hangup", "callId": "b" });
        assert!(!verify_message(&identity.public_key_base64(), &tampered, &signature));
        assert!(!verify_message("garbage", &payload, &signature));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();

        let first = LocalIdentity::load_or_create_in(dir.path(), "user/with:odd chars").unwrap();
        let second = LocalIdentity::load_or_create_in(dir.path(), "user/with:odd chars").unwrap();
        assert_eq!(first.public_key_base64(), second.public_key_base64());

        let other = LocalIdentity::load_or_create_in(dir.path(), "bob").unwrap();
        assert_ne!(first.public_key_base64(), other.public_key_base64());
    }

    #[test]
    fn test_corrupt_key_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("carol.key"), BASE64.encode([1u8; 5])).unwrap();

        let err = LocalIdentity::load_or_create_in(dir.path(), "carol").unwrap_err();
        assert!(matches!(err, IdentityError::InvalidKeyLength(5)));
    }
}
