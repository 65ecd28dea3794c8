use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{CryptoError, IdentitySecret, Kek};

const SEALED_SECRET_AAD: &str = "aether-sync:identity-secret:v1:";

/// Secret d'identité scellé par la KEK, lié au nom d'utilisateur via l'AAD.
///
/// Un fichier d'identité dont le nom a été modifié ne se déverrouille plus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedSecret {
    pub nonce: [u8; 24],
    pub payload: Vec<u8>,
}

impl SealedSecret {
    pub fn seal(kek: &Kek, secret: &IdentitySecret, user_name: &str) -> Result<Self, CryptoError> {
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let aad = bound_aad(user_name);
        let payload = cipher(kek).encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: secret.as_bytes(),
                aad: aad.as_bytes(),
            },
        )?;
        Ok(Self { nonce, payload })
    }

    pub fn open(&self, kek: &Kek, user_name: &str) -> Result<IdentitySecret, CryptoError> {
        let aad = bound_aad(user_name);
        let plaintext = Zeroizing::new(cipher(kek).decrypt(
            XNonce::from_slice(&self.nonce),
            Payload {
                msg: &self.payload,
                aad: aad.as_bytes(),
            },
        )?);
        IdentitySecret::from_slice(&plaintext)
    }
}

fn bound_aad(user_name: &str) -> String {
    format!("{SEALED_SECRET_AAD}{}", user_name.to_lowercase())
}

fn cipher(kek: &Kek) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(Key::from_slice(kek.as_bytes()))
}
