use std::fmt;
use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::StaticSecret;

use crate::crypto::envelope::public_key_hex;
use crate::crypto::{
    CryptoCore, CryptoError, DerivedKey, IdentitySecret, KeyHierarchy, SealedSecret,
    PasswordSecret,
};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity file is malformed: {0}")]
    Format(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Identité scellée telle que persistée sur disque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFile {
    pub user_name: String,
    pub password_salt: [u8; 16],
    pub sealed_secret: SealedSecret,
}

impl IdentityFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdentityError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), IdentityError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Matériel de clé du principal actif.
///
/// Construit une seule fois au déverrouillage puis passé explicitement aux opérations
/// (pas d'état global). Fournit la clé publique X25519 qui identifie le principal,
/// la clé de signature Ed25519 des fichiers distants et la clé du cache local.
pub struct IdentityContext {
    user_name: String,
    encryption_key: StaticSecret,
    public_key: String,
    signing_key: SigningKey,
    cache_key: DerivedKey,
}

impl IdentityContext {
    pub fn from_secret(user_name: &str, secret: &IdentitySecret) -> Result<Self, CryptoError> {
        let core = CryptoCore::default();
        let encryption_key = StaticSecret::from(*secret.as_bytes());
        let public_key = public_key_hex(&encryption_key);
        let signing_seed = core.derive_signing_seed(secret)?;
        let signing_key = SigningKey::from_bytes(signing_seed.as_bytes());
        let cache_key = core.derive_cache_key(secret)?;
        Ok(Self {
            user_name: user_name.to_string(),
            encryption_key,
            public_key,
            signing_key,
            cache_key,
        })
    }

    /// Crée une nouvelle identité et renvoie le fichier scellé à persister.
    pub fn create(
        user_name: &str,
        password: &PasswordSecret,
    ) -> Result<(Self, IdentityFile), CryptoError> {
        let password_salt = CryptoCore::default().random_password_salt();
        let hierarchy = KeyHierarchy::bootstrap(password, password_salt)?;
        let sealed_secret = hierarchy.seal_secret(user_name)?;
        let context = Self::from_secret(user_name, hierarchy.secret())?;
        log::info!("IdentityContext::create: new identity for {}", user_name);
        Ok((
            context,
            IdentityFile {
                user_name: user_name.to_string(),
                password_salt,
                sealed_secret,
            },
        ))
    }

    pub fn unlock(file: &IdentityFile, password: &PasswordSecret) -> Result<Self, CryptoError> {
        let hierarchy = KeyHierarchy::restore(
            password,
            file.password_salt,
            &file.sealed_secret,
            &file.user_name,
        )?;
        Self::from_secret(&file.user_name, hierarchy.secret())
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Clé publique (hex) du principal.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn encryption_key(&self) -> &StaticSecret {
        &self.encryption_key
    }

    pub fn cache_key(&self) -> &DerivedKey {
        &self.cache_key
    }

    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        self.signing_key
            .verifying_key()
            .verify(data, &Signature::from_bytes(&bytes))
            .is_ok()
    }

    /// Compare un nom d'utilisateur à celui du principal (insensible à la casse).
    pub fn is_self(&self, user_name: &str) -> bool {
        self.user_name.eq_ignore_ascii_case(user_name)
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("user_name", &self.user_name)
            .field("public_key", &self.public_key)
            .field("keys", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn signatures_verify_only_for_signed_content() {
        let identity =
            IdentityContext::from_secret("alice.id", &IdentitySecret::from_bytes([4u8; 32]))
                .unwrap();
        let signature = identity.sign(b"master-index");

        assert!(identity.verify(b"master-index", &signature));
        assert!(!identity.verify(b"master-index-tampered", &signature));
        assert!(!identity.verify(b"master-index", &signature[..10]));
    }

    #[test]
    fn public_key_is_stable_for_secret() {
        let secret = IdentitySecret::from_bytes([8u8; 32]);
        let a = IdentityContext::from_secret("bob.id", &secret).unwrap();
        let b = IdentityContext::from_secret("bob.id", &secret).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.public_key().len(), 64);
        assert!(a.is_self("BOB.id"));
    }

    #[test]
    fn identity_file_create_save_unlock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.json");
        let password = PasswordSecret::new("identity-pass");

        let (created, file) = IdentityContext::create("carol.id", &password).unwrap();
        file.save(&path).unwrap();

        let loaded = IdentityFile::load(&path).unwrap();
        let unlocked = IdentityContext::unlock(&loaded, &password).unwrap();
        assert_eq!(created.public_key(), unlocked.public_key());
        assert_eq!(unlocked.user_name(), "carol.id");

        let wrong = PasswordSecret::new("wrong-pass");
        assert!(IdentityContext::unlock(&loaded, &wrong).is_err());

        let mut renamed = loaded.clone();
        renamed.user_name = "mallory.id".to_string();
        assert!(IdentityContext::unlock(&renamed, &password).is_err());
    }
}
