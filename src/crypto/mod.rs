use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod envelope;
pub mod mkek;
pub use envelope::Envelope;
pub use mkek::SealedSecret;

const KEK_LEN: usize = 32;
pub const SECRET_LEN: usize = 32;
const SIGNING_SEED_INFO: &[u8] = b"aether-sync:signing-seed:v1";
const CACHE_KEY_INFO: &[u8] = b"aether-sync:cache-key:v1";

/// Erreurs génériques du module Crypto.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("argon2 failure: {0}")]
    InvalidPassword(String),
    #[error("hkdf output length invalid")]
    HkdfLength,
    #[error("aead failure (xchacha20-poly1305)")]
    Aead,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl From<aead::Error> for CryptoError {
    fn from(_: aead::Error) -> Self {
        CryptoError::Aead
    }
}

/// Secret utilisateur (phrase de passe) manipulé côté Rust uniquement.
pub struct PasswordSecret(SecretString);

impl PasswordSecret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        let boxed: Box<str> = value.into().into_boxed_str();
        Self(SecretString::new(boxed))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for PasswordSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PasswordSecret")
            .field(&"<redacted>")
            .finish()
    }
}

/// Représentation sécurisée de la KEK (Key Encryption Key).
pub struct Kek(Zeroizing<Vec<u8>>);

impl Kek {
    fn from_vec(buffer: Vec<u8>) -> Self {
        Self(Zeroizing::new(buffer))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl fmt::Debug for Kek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Kek").field(&"<redacted>").finish()
    }
}

/// Secret racine (256 bits) de l'identité du principal.
///
/// Toutes les autres clés (X25519, Ed25519, clé du cache local) en sont dérivées.
pub struct IdentitySecret(Zeroizing<[u8; SECRET_LEN]>);

impl IdentitySecret {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "identity secret length is {} instead of {}",
                bytes.len(),
                SECRET_LEN
            ))
        })?;
        Ok(Self::from_bytes(array))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentitySecret").field(&"<redacted>").finish()
    }
}

/// Clé symétrique dérivée via HKDF (cache local, graine de signature).
pub struct DerivedKey(Zeroizing<[u8; SECRET_LEN]>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DerivedKey").field(&"<redacted>").finish()
    }
}

/// Paramétrage centralisé de la hiérarchie Argon2id -> KEK -> secret d'identité.
#[derive(Clone)]
pub struct CryptoCore {
    argon2: Argon2<'static>,
}

impl CryptoCore {
    pub fn new() -> Self {
        // Paramètres par défaut (64 MiB, 3 itérations, parallélisme 1).
        let params =
            Params::new(64 * 1024, 3, 1, Some(KEK_LEN)).expect("argon2 params must be valid");
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        Self { argon2 }
    }

    pub fn derive_kek(
        &self,
        password: &PasswordSecret,
        salt: &[u8; 16],
    ) -> Result<Kek, CryptoError> {
        let mut output = vec![0u8; KEK_LEN];
        self.argon2
            .hash_password_into(password.expose().as_bytes(), salt, &mut output)
            .map_err(|err| CryptoError::InvalidPassword(err.to_string()))?;
        Ok(Kek::from_vec(output))
    }

    pub fn generate_identity_secret(&self) -> IdentitySecret {
        IdentitySecret::from_bytes(random_key())
    }

    pub fn derive_signing_seed(&self, secret: &IdentitySecret) -> Result<DerivedKey, CryptoError> {
        derive_subkey(secret.as_bytes(), SIGNING_SEED_INFO)
    }

    pub fn derive_cache_key(&self, secret: &IdentitySecret) -> Result<DerivedKey, CryptoError> {
        derive_subkey(secret.as_bytes(), CACHE_KEY_INFO)
    }

    pub fn random_password_salt(&self) -> [u8; 16] {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        salt
    }
}

impl Default for CryptoCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Génère 32 octets aléatoires (clé privée de ressource, secret d'identité).
pub fn random_key() -> [u8; SECRET_LEN] {
    let mut buffer = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut buffer);
    buffer
}

pub(crate) fn derive_subkey(ikm: &[u8], info: &[u8]) -> Result<DerivedKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; SECRET_LEN];
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::HkdfLength)?;
    Ok(DerivedKey(Zeroizing::new(okm)))
}

/// Agrège l'état sensible (KEK + secret d'identité) pour la session en cours.
pub struct KeyHierarchy {
    kek: Kek,
    secret: IdentitySecret,
}

impl KeyHierarchy {
    /// Bootstrap complet : dérive la KEK et génère un nouveau secret d'identité.
    pub fn bootstrap(password: &PasswordSecret, salt: [u8; 16]) -> Result<Self, CryptoError> {
        let core = CryptoCore::default();
        let kek = core.derive_kek(password, &salt)?;
        let secret = core.generate_identity_secret();
        Ok(Self { kek, secret })
    }

    /// Reconstruction lorsque le secret scellé est déjà connu.
    pub fn restore(
        password: &PasswordSecret,
        salt: [u8; 16],
        sealed: &SealedSecret,
        user_name: &str,
    ) -> Result<Self, CryptoError> {
        let core = CryptoCore::default();
        let kek = core.derive_kek(password, &salt)?;
        let secret = sealed.open(&kek, user_name)?;
        Ok(Self { kek, secret })
    }

    pub fn kek(&self) -> &Kek {
        &self.kek
    }

    pub fn secret(&self) -> &IdentitySecret {
        &self.secret
    }

    pub fn seal_secret(&self, user_name: &str) -> Result<SealedSecret, CryptoError> {
        SealedSecret::seal(&self.kek, &self.secret, user_name)
    }
}

impl fmt::Debug for KeyHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHierarchy")
            .field("kek", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}
