use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::{validate_path, BlobStore, RemoteError};
use crate::crypto::envelope::{self, Envelope};
use crate::identity::IdentityContext;

const PROFILE_FILE: &str = "profile.json";
const SIGNATURE_SUFFIX: &str = ".sig";

/// Mode de déchiffrement d'une lecture distante.
#[derive(Clone, Copy)]
pub enum Decrypt<'a> {
    /// Contenu renvoyé tel quel.
    None,
    /// Déchiffré avec la clé de la session.
    Session,
    /// Déchiffré avec une clé privée de ressource.
    WithKey(&'a StaticSecret),
}

#[derive(Clone, Copy)]
pub struct GetOptions<'a> {
    pub decrypt: Decrypt<'a>,
    pub verify: bool,
    /// Lit dans le bucket d'un autre utilisateur.
    pub user_name: Option<&'a str>,
}

impl<'a> GetOptions<'a> {
    /// Fichier privé du principal : déchiffrement + vérification de signature.
    pub fn private() -> Self {
        Self {
            decrypt: Decrypt::Session,
            verify: true,
            user_name: None,
        }
    }

    /// Contenu brut, sans déchiffrement ni vérification.
    pub fn raw(user_name: Option<&'a str>) -> Self {
        Self {
            decrypt: Decrypt::None,
            verify: false,
            user_name,
        }
    }

    pub fn with_key(key: &'a StaticSecret, user_name: Option<&'a str>) -> Self {
        Self {
            decrypt: Decrypt::WithKey(key),
            verify: false,
            user_name,
        }
    }
}

/// Mode de chiffrement d'une écriture distante.
#[derive(Clone, Copy)]
pub enum Encrypt<'a> {
    None,
    Session,
    ForPublicKey(&'a PublicKey),
}

#[derive(Clone, Copy)]
pub struct PutOptions<'a> {
    pub encrypt: Encrypt<'a>,
    pub sign: bool,
}

impl<'a> PutOptions<'a> {
    /// Écriture chiffrée pour le principal et signée.
    pub fn private() -> Self {
        Self {
            encrypt: Encrypt::Session,
            sign: true,
        }
    }

    /// Écriture d'un contenu déjà chiffré par l'appelant.
    pub fn raw() -> Self {
        Self {
            encrypt: Encrypt::None,
            sign: false,
        }
    }
}

/// Profil public publié par chaque utilisateur dans son bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_name: String,
    pub public_key: String,
    pub verifying_key: String,
}

/// Session authentifiée sur le hub : identité + primitives get/put/chiffrement/signature.
pub struct Session<S: BlobStore> {
    store: S,
    identity: IdentityContext,
}

impl<S: BlobStore> Session<S> {
    pub fn new(store: S, identity: IdentityContext) -> Self {
        Self { store, identity }
    }

    pub fn identity(&self) -> &IdentityContext {
        &self.identity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn public_key(&self) -> &str {
        self.identity.public_key()
    }

    fn bucket<'b>(&'b self, user_name: Option<&'b str>) -> &'b str {
        user_name.unwrap_or_else(|| self.identity.user_name())
    }

    pub async fn get_file(
        &self,
        path: &str,
        options: GetOptions<'_>,
    ) -> Result<Vec<u8>, RemoteError> {
        validate_path(path)?;
        let bucket = self.bucket(options.user_name);
        let raw = self
            .store
            .get(bucket, path)
            .await?
            .ok_or_else(|| RemoteError::NotFound(format!("{bucket}/{path}")))?;

        if options.verify {
            let signature = self
                .store
                .get(bucket, &format!("{path}{SIGNATURE_SUFFIX}"))
                .await?
                .ok_or_else(|| RemoteError::Verify(path.to_string()))?;
            if !self.verify_signature(bucket, &raw, &signature).await? {
                log::warn!("Session::get_file: signature mismatch for {}/{}", bucket, path);
                return Err(RemoteError::Verify(path.to_string()));
            }
        }

        match options.decrypt {
            Decrypt::None => Ok(raw),
            Decrypt::Session => self.decrypt_content(&raw, None).map_err(|e| with_path(e, path)),
            Decrypt::WithKey(key) => self
                .decrypt_content(&raw, Some(key))
                .map_err(|e| with_path(e, path)),
        }
    }

    pub async fn put_file(
        &self,
        path: &str,
        data: &[u8],
        options: PutOptions<'_>,
    ) -> Result<(), RemoteError> {
        validate_path(path)?;
        let bucket = self.identity.user_name();
        let payload = match options.encrypt {
            Encrypt::None => data.to_vec(),
            Encrypt::Session => self.encrypt_content(data, None)?,
            Encrypt::ForPublicKey(public_key) => self.encrypt_content(data, Some(public_key))?,
        };
        self.store.put(bucket, path, &payload).await?;
        let signature_path = format!("{path}{SIGNATURE_SUFFIX}");
        if options.sign {
            let signature = self.identity.sign(&payload);
            self.store.put(bucket, &signature_path, &signature).await?;
        }
        log::debug!(
            "Session::put_file: {}/{} ({} bytes, signed={})",
            bucket,
            path,
            payload.len(),
            options.sign
        );
        Ok(())
    }

    /// Supprime un fichier et sa signature éventuelle.
    pub async fn delete_file(&self, path: &str) -> Result<(), RemoteError> {
        validate_path(path)?;
        let bucket = self.identity.user_name();
        self.store.delete(bucket, path).await?;
        self.store
            .delete(bucket, &format!("{path}{SIGNATURE_SUFFIX}"))
            .await
    }

    /// Liste les fichiers du principal (signatures exclues).
    pub async fn list_files(&self) -> Result<Vec<String>, RemoteError> {
        let files = self.store.list(self.identity.user_name()).await?;
        Ok(files
            .into_iter()
            .filter(|name| !name.ends_with(SIGNATURE_SUFFIX))
            .collect())
    }

    /// Test d'existence brut (sans déchiffrement).
    pub async fn file_exists(
        &self,
        path: &str,
        user_name: Option<&str>,
    ) -> Result<bool, RemoteError> {
        match self.get_file(path, GetOptions::raw(user_name)).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Chiffre pour une clé publique donnée, ou pour le principal par défaut.
    pub fn encrypt_content(
        &self,
        data: &[u8],
        public_key: Option<&PublicKey>,
    ) -> Result<Vec<u8>, RemoteError> {
        let own = PublicKey::from(self.identity.encryption_key());
        let recipient = public_key.unwrap_or(&own);
        envelope::seal(recipient, data)
            .and_then(|sealed| sealed.to_bytes())
            .map_err(RemoteError::Encrypt)
    }

    /// Déchiffre avec une clé privée donnée, ou avec celle de la session par défaut.
    pub fn decrypt_content(
        &self,
        data: &[u8],
        private_key: Option<&StaticSecret>,
    ) -> Result<Vec<u8>, RemoteError> {
        let key = private_key.unwrap_or_else(|| self.identity.encryption_key());
        Envelope::from_bytes(data)
            .and_then(|sealed| envelope::open(key, &sealed))
            .map_err(|source| RemoteError::Decrypt {
                path: String::new(),
                source,
            })
    }

    pub async fn publish_profile(&self) -> Result<(), RemoteError> {
        let profile = Profile {
            user_name: self.identity.user_name().to_string(),
            public_key: self.identity.public_key().to_string(),
            verifying_key: self.identity.verifying_key_hex(),
        };
        let json = serde_json::to_vec(&profile)
            .map_err(|e| RemoteError::Backend(format!("profile serialization: {e}")))?;
        self.put_file(PROFILE_FILE, &json, PutOptions::raw()).await
    }

    pub async fn lookup_profile(&self, user_name: &str) -> Result<Profile, RemoteError> {
        // Lecture brute directe : la vérification de signature passe elle-même par le profil.
        let Some(bytes) = self.store.get(user_name, PROFILE_FILE).await? else {
            return Err(RemoteError::UnknownUser(user_name.to_string()));
        };
        serde_json::from_slice(&bytes).map_err(|_| RemoteError::UnknownUser(user_name.to_string()))
    }

    /// Clé publique d'un utilisateur (la nôtre si `user_name` désigne le principal).
    pub async fn lookup_public_key(&self, user_name: Option<&str>) -> Result<String, RemoteError> {
        match user_name {
            Some(name) if !self.identity.is_self(name) => {
                Ok(self.lookup_profile(name).await?.public_key)
            }
            _ => Ok(self.identity.public_key().to_string()),
        }
    }

    async fn verify_signature(
        &self,
        bucket: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool, RemoteError> {
        if self.identity.is_self(bucket) {
            return Ok(self.identity.verify(data, signature));
        }
        let profile = self.lookup_profile(bucket).await?;
        let Ok(key_bytes) = hex::decode(&profile.verifying_key) else {
            return Ok(false);
        };
        let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return Ok(false);
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_array) else {
            return Ok(false);
        };
        let Ok(signature) = <[u8; 64]>::try_from(signature) else {
            return Ok(false);
        };
        Ok(verifying_key
            .verify(data, &Signature::from_bytes(&signature))
            .is_ok())
    }
}

fn with_path(error: RemoteError, path: &str) -> RemoteError {
    match error {
        RemoteError::Decrypt { source, .. } => RemoteError::Decrypt {
            path: path.to_string(),
            source,
        },
        other => other,
    }
}

/// Décodage d'une clé publique pour `Encrypt::ForPublicKey`.
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, RemoteError> {
    envelope::parse_public_key(hex_key).map_err(RemoteError::Encrypt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, TestHub};

    #[tokio::test]
    async fn private_files_roundtrip_with_signature() {
        let hub = TestHub::new();
        let session = hub.session("alice.id", 1);

        session
            .put_file("master-index", b"{}", PutOptions::private())
            .await
            .unwrap();
        let content = session.get_file("master-index", GetOptions::private()).await.unwrap();
        assert_eq!(content, b"{}");

        // Le contenu stocké est chiffré.
        let raw = session.get_file("master-index", GetOptions::raw(None)).await.unwrap();
        assert_ne!(raw, b"{}");
    }

    #[tokio::test]
    async fn stale_signature_fails_verification() {
        let hub = TestHub::new();
        let session = hub.session("alice.id", 1);

        session
            .put_file("master-index", b"{}", PutOptions::private())
            .await
            .unwrap();
        // Contenu remplacé sans nouvelle signature.
        let other = session.encrypt_content(b"{\"a\":1}", None).unwrap();
        session
            .store()
            .put("alice.id", "master-index", &other)
            .await
            .unwrap();

        let result = session.get_file("master-index", GetOptions::private()).await;
        assert!(matches!(result, Err(RemoteError::Verify(_))));
    }

    #[tokio::test]
    async fn missing_file_and_unknown_user() {
        let hub = TestHub::new();
        let session = hub.session("alice.id", 1);

        let missing = session.get_file("videos/none.index", GetOptions::private()).await;
        assert!(matches!(missing, Err(RemoteError::NotFound(_))));
        assert!(!session.file_exists("videos/none.index", None).await.unwrap());

        let unknown = session.lookup_public_key(Some("ghost.id")).await;
        assert!(matches!(unknown, Err(RemoteError::UnknownUser(_))));
    }

    #[tokio::test]
    async fn content_encrypted_for_another_user() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let bob = hub.session("bob.id", 2);
        bob.publish_profile().await.unwrap();

        let bob_key = alice.lookup_public_key(Some("bob.id")).await.unwrap();
        assert_eq!(bob_key, identity("bob.id", 2).public_key());

        let recipient = public_key_from_hex(&bob_key).unwrap();
        alice
            .put_file("share/x/master-index", b"shared", PutOptions {
                encrypt: Encrypt::ForPublicKey(&recipient),
                sign: false,
            })
            .await
            .unwrap();

        let raw = bob
            .get_file("share/x/master-index", GetOptions::raw(Some("alice.id")))
            .await
            .unwrap();
        assert_eq!(bob.decrypt_content(&raw, None).unwrap(), b"shared");
        assert!(alice.decrypt_content(&raw, None).is_err());
    }

    #[tokio::test]
    async fn signatures_of_another_user_check_against_their_profile() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let bob = hub.session("bob.id", 2);
        alice.publish_profile().await.unwrap();
        alice
            .put_file("notes/hello", b"signed by alice", PutOptions {
                encrypt: Encrypt::None,
                sign: true,
            })
            .await
            .unwrap();

        let options = GetOptions {
            decrypt: Decrypt::None,
            verify: true,
            user_name: Some("alice.id"),
        };
        let content = bob.get_file("notes/hello", options).await.unwrap();
        assert_eq!(content, b"signed by alice");

        alice
            .store()
            .put("alice.id", "notes/hello", b"tampered")
            .await
            .unwrap();
        let options = GetOptions {
            decrypt: Decrypt::None,
            verify: true,
            user_name: Some("alice.id"),
        };
        let result = bob.get_file("notes/hello", options).await;
        assert!(matches!(result, Err(RemoteError::Verify(_))));
    }
}
