use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::envelope::{parse_private_key, parse_public_key};
use crate::crypto::random_key;
use crate::error::{Result, SyncError};
use crate::index::{private_key_path, share_root, ResourceMetadata};
use crate::remote::{BlobStore, Decrypt, GetOptions, PutOptions, RemoteError, Session};

/// Résolution, création et partage des clés privées par ressource.
pub struct KeyManager<'a, S: BlobStore> {
    session: &'a Session<S>,
}

impl<'a, S: BlobStore> KeyManager<'a, S> {
    pub fn new(session: &'a Session<S>) -> Self {
        Self { session }
    }

    /// Clé privée d'une ressource, ou `None` si elle est inutilisable par ce principal.
    ///
    /// Avec `acting_user`, le fichier de clé a été rechiffré pour nous par le propriétaire :
    /// on le lit sans vérification dans son bucket puis on le déchiffre avec notre clé.
    pub async fn resolve_private_key(
        &self,
        scope_root: &str,
        id: &str,
        resource_type: &str,
        acting_user: Option<&str>,
    ) -> Option<StaticSecret> {
        let key_file = private_key_path(scope_root, id, resource_type);
        let fetched = match acting_user {
            Some(user) => match self
                .session
                .get_file(&key_file, GetOptions::raw(Some(user)))
                .await
            {
                Ok(encrypted) => self.session.decrypt_content(&encrypted, None),
                Err(e) => Err(e),
            },
            None => self.session.get_file(&key_file, GetOptions::private()).await,
        };

        let plaintext = match fetched {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) => {
                log::debug!("KeyManager::resolve_private_key: {} unavailable: {}", key_file, e);
                return None;
            }
        };
        let text = String::from_utf8_lossy(&plaintext);
        match parse_private_key(&text) {
            Ok(key) => Some(key),
            Err(e) => {
                log::warn!("KeyManager::resolve_private_key: {} malformed: {}", key_file, e);
                None
            }
        }
    }

    /// Génère et stocke (chiffrée + signée) une nouvelle clé privée de ressource.
    pub async fn create_private_key(&self, id: &str, resource_type: &str) -> Result<StaticSecret> {
        let key_file = private_key_path("", id, resource_type);
        let secret = StaticSecret::from(random_key());
        let encoded = Zeroizing::new(hex::encode(secret.to_bytes()));
        self.session
            .put_file(&key_file, encoded.as_bytes(), PutOptions::private())
            .await?;
        log::info!("KeyManager::create_private_key: stored {}", key_file);
        Ok(secret)
    }

    /// Prépare la clé de la ressource chiffrée pour un destinataire.
    ///
    /// Renvoie `(chemin, contenu)` sans rien écrire ; échoue si notre clé est introuvable.
    pub async fn prepare_grant(
        &self,
        id: &str,
        resource_type: &str,
        grantee_public_key: &str,
    ) -> Result<(String, Vec<u8>)> {
        let grantee = parse_public_key(grantee_public_key)?;
        let root = share_root(grantee_public_key);
        let owner_key = self
            .resolve_private_key("", id, resource_type, None)
            .await
            .ok_or_else(|| {
                log::error!("KeyManager::prepare_grant: no private key for {}/{}", resource_type, id);
                SyncError::KeyUnavailable("Unable to get private key for sharing.".to_string())
            })?;
        let encoded = Zeroizing::new(hex::encode(owner_key.to_bytes()));
        let encrypted = self.session.encrypt_content(encoded.as_bytes(), Some(&grantee))?;
        Ok((private_key_path(&root, id, resource_type), encrypted))
    }

    /// Donne accès à une ressource au détenteur de `grantee_public_key`.
    pub async fn grant_share(
        &self,
        id: &str,
        resource_type: &str,
        grantee_public_key: &str,
    ) -> Result<()> {
        let (key_file, encrypted) = self.prepare_grant(id, resource_type, grantee_public_key).await?;
        self.session
            .put_file(&key_file, &encrypted, PutOptions::raw())
            .await?;
        Ok(())
    }

    /// Retire la clé partagée ; une clé déjà absente n'est pas une erreur.
    pub async fn revoke_share(
        &self,
        id: &str,
        resource_type: &str,
        grantee_public_key: &str,
    ) -> Result<()> {
        let key_file = private_key_path(&share_root(grantee_public_key), id, resource_type);
        match self.session.delete_file(&key_file).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Vrai si la ressource est actuellement partagée avec `share_user`.
    pub async fn is_file_shared(&self, share_user: &str, metadata: &ResourceMetadata) -> Result<bool> {
        let grantee = self.session.lookup_public_key(Some(share_user)).await?;
        let key_file = private_key_path(&share_root(&grantee), &metadata.id, &metadata.resource_type);
        Ok(self.session.file_exists(&key_file, None).await?)
    }

    /// Lit et déchiffre le contenu d'une ressource, qu'elle soit à nous ou partagée.
    pub async fn fetch_resource(
        &self,
        path: &str,
        id: &str,
        resource_type: &str,
        owner: Option<&str>,
    ) -> Result<Vec<u8>> {
        let acting_user = owner.filter(|o| !self.session.identity().is_self(o));
        let root = match acting_user {
            Some(_) => share_root(self.session.public_key()),
            None => String::new(),
        };

        if let Some(key) = self
            .resolve_private_key(&root, id, resource_type, acting_user)
            .await
        {
            match self
                .session
                .get_file(path, GetOptions::with_key(&key, acting_user))
                .await
            {
                Ok(content) => return Ok(content),
                Err(e) => log::debug!("KeyManager::fetch_resource: keyed read of {} failed: {}", path, e),
            }
        }

        // Repli : contenu chiffré directement pour la session.
        let fallback = GetOptions {
            decrypt: Decrypt::Session,
            verify: false,
            user_name: acting_user,
        };
        Ok(self.session.get_file(path, fallback).await?)
    }
}

/// Clé publique associée à une clé privée de ressource.
pub fn resource_public_key(key: &StaticSecret) -> PublicKey {
    PublicKey::from(key)
}
