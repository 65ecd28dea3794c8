//! Scellement local des entrées du cache.
//!
//! Le cache ne stocke jamais de clair : chaque document de métadonnées est rechiffré
//! avec une clé dérivée de la clé de cache (HKDF, salt par entrée) et lié à l'identifiant
//! de l'entrée par l'AAD.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, DerivedKey, SECRET_LEN};

pub mod blob_format;
pub use blob_format::{BlobHeader, SealedBlob};

use blob_format::{CIPHER_ID, MAGIC_NUMBER, VERSION};

const ENTRY_KEY_INFO: &[u8] = b"aether-sync:cache-entry-key:v1";
const AAD_PREFIX: &[u8] = b"aether-sync:cache-entry:v1:";

/// Erreurs du module Storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid blob format: {0}")]
    InvalidFormat(String),
    #[error("invalid sealed blob header")]
    InvalidHeader,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Scelle le contenu d'une entrée de cache.
///
/// # Arguments
/// * `cache_key` - Clé de cache dérivée de l'identité
/// * `plaintext` - Document de métadonnées en clair
/// * `entry_id` - Identifiant de l'entrée (lié dans l'AAD)
pub fn seal_entry(
    cache_key: &DerivedKey,
    plaintext: &[u8],
    entry_id: &str,
) -> Result<SealedBlob, StorageError> {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    let entry_key = derive_entry_key(cache_key, &salt)?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&entry_key[..]));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &build_aad(entry_id),
            },
        )
        .map_err(CryptoError::from)?;

    let commitment = commitment(&MAGIC_NUMBER, VERSION, CIPHER_ID, &salt, &entry_key[..]);

    Ok(SealedBlob {
        header: BlobHeader {
            magic: MAGIC_NUMBER,
            version: VERSION,
            cipher_id: CIPHER_ID,
            salt,
            commitment,
            nonce: nonce_bytes,
        },
        ciphertext: Zeroizing::new(ciphertext),
    })
}

/// Ouvre une entrée scellée par [`seal_entry`] pour le même identifiant.
pub fn open_entry(
    cache_key: &DerivedKey,
    blob: &SealedBlob,
    entry_id: &str,
) -> Result<Vec<u8>, StorageError> {
    let header = &blob.header;
    if header.magic != MAGIC_NUMBER {
        return Err(StorageError::InvalidFormat("Invalid magic number".to_string()));
    }
    if header.version != VERSION {
        return Err(StorageError::InvalidFormat(format!(
            "Unsupported version: 0x{:02x}",
            header.version
        )));
    }
    if header.cipher_id != CIPHER_ID {
        return Err(StorageError::InvalidFormat(format!(
            "Unsupported cipher ID: 0x{:02x}",
            header.cipher_id
        )));
    }

    let entry_key = derive_entry_key(cache_key, &header.salt)?;
    let expected = commitment(
        &header.magic,
        header.version,
        header.cipher_id,
        &header.salt,
        &entry_key[..],
    );
    if expected != header.commitment {
        return Err(StorageError::InvalidFormat(
            "Commitment verification failed".to_string(),
        ));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&entry_key[..]));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&header.nonce),
            Payload {
                msg: blob.ciphertext.as_ref(),
                aad: &build_aad(entry_id),
            },
        )
        .map_err(CryptoError::from)?;
    Ok(plaintext)
}

fn derive_entry_key(
    cache_key: &DerivedKey,
    salt: &[u8; 32],
) -> Result<Zeroizing<[u8; SECRET_LEN]>, StorageError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), cache_key.as_bytes());
    let mut okm = Zeroizing::new([0u8; SECRET_LEN]);
    hkdf.expand(ENTRY_KEY_INFO, &mut okm[..])
        .map_err(|_| CryptoError::HkdfLength)?;
    Ok(okm)
}

/// SHA-256(Magic + Version + CipherID + Salt + clé d'entrée).
fn commitment(magic: &[u8; 4], version: u8, cipher_id: u8, salt: &[u8; 32], entry_key: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(magic);
    hasher.update([version, cipher_id]);
    hasher.update(salt);
    hasher.update(entry_key);
    hasher.finalize().into()
}

fn build_aad(entry_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_PREFIX.len() + entry_id.len());
    aad.extend_from_slice(AAD_PREFIX);
    aad.extend_from_slice(entry_id.as_bytes());
    aad
}
