use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{random_key, CryptoError, SECRET_LEN};

const ENVELOPE_INFO: &[u8] = b"aether-sync:envelope:v1";
const NONCE_LEN: usize = 24;

/// Contenu chiffré pour une clé publique X25519 (schéma type ECIES).
///
/// Sérialisé en JSON pour être stocké tel quel côté distant ou dans le cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub cipher_text: String,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(data).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

/// Décode une clé publique X25519 encodée en hexadécimal.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("public key is not hex: {e}")))?;
    let array: [u8; SECRET_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key length invalid".to_string()))?;
    Ok(PublicKey::from(array))
}

/// Décode une clé privée X25519 encodée en hexadécimal (fichiers `private.key`).
pub fn parse_private_key(hex_key: &str) -> Result<StaticSecret, CryptoError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("private key is not hex: {e}")))?,
    );
    let array: [u8; SECRET_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("private key length invalid".to_string()))?;
    Ok(StaticSecret::from(array))
}

pub fn public_key_hex(secret: &StaticSecret) -> String {
    hex::encode(PublicKey::from(secret).as_bytes())
}

pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let ephemeral = StaticSecret::from(random_key());
    let ephemeral_public = PublicKey::from(&ephemeral);
    let cipher = build_cipher(&ephemeral, recipient, &ephemeral_public)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher.encrypt(
        XNonce::from_slice(&nonce),
        Payload {
            msg: plaintext,
            aad: ephemeral_public.as_bytes(),
        },
    )?;

    Ok(Envelope {
        ephemeral_public_key: hex::encode(ephemeral_public.as_bytes()),
        nonce: hex::encode(nonce),
        cipher_text: hex::encode(ciphertext),
    })
}

pub fn open(secret: &StaticSecret, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let ephemeral_public = parse_public_key(&envelope.ephemeral_public_key)?;
    let nonce = hex::decode(&envelope.nonce)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("nonce: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope("nonce length invalid".to_string()));
    }
    let ciphertext = hex::decode(&envelope.cipher_text)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("cipher text: {e}")))?;

    // Le destinataire refait l'échange avec la clé éphémère de l'émetteur.
    let recipient_public = PublicKey::from(secret);
    let hkdf_salt = [&ephemeral_public.as_bytes()[..], &recipient_public.as_bytes()[..]].concat();
    let shared = secret.diffie_hellman(&ephemeral_public);
    let cipher = cipher_from_shared(shared.as_bytes(), &hkdf_salt)?;

    let plaintext = cipher.decrypt(
        XNonce::from_slice(&nonce),
        Payload {
            msg: &ciphertext,
            aad: ephemeral_public.as_bytes(),
        },
    )?;
    Ok(plaintext)
}

fn build_cipher(
    ephemeral: &StaticSecret,
    recipient: &PublicKey,
    ephemeral_public: &PublicKey,
) -> Result<XChaCha20Poly1305, CryptoError> {
    let hkdf_salt = [&ephemeral_public.as_bytes()[..], &recipient.as_bytes()[..]].concat();
    let shared = ephemeral.diffie_hellman(recipient);
    cipher_from_shared(shared.as_bytes(), &hkdf_salt)
}

fn cipher_from_shared(shared: &[u8], salt: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = Zeroizing::new([0u8; SECRET_LEN]);
    hkdf.expand(ENVELOPE_INFO, &mut okm[..])
        .map_err(|_| CryptoError::HkdfLength)?;
    Ok(XChaCha20Poly1305::new(Key::from_slice(&okm[..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_opens_only_for_recipient() {
        let alice = StaticSecret::from([1u8; SECRET_LEN]);
        let mallory = StaticSecret::from([2u8; SECRET_LEN]);

        let envelope = seal(&PublicKey::from(&alice), b"resource key material").unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(open(&alice, &parsed).unwrap(), b"resource key material");
        assert!(open(&mallory, &parsed).is_err());
    }

    #[test]
    fn private_key_hex_parsing() {
        let secret = StaticSecret::from([9u8; SECRET_LEN]);
        let encoded = hex::encode(secret.to_bytes());
        let parsed = parse_private_key(&encoded).unwrap();
        assert_eq!(public_key_hex(&parsed), public_key_hex(&secret));

        assert!(parse_private_key("not-hex").is_err());
        assert!(parse_public_key("abcd").is_err());
    }
}
