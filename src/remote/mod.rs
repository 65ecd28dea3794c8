//! Frontière avec le stockage distant (hub de blobs par utilisateur).
//!
//! Le stockage distant est considéré comme éventuellement cohérent et potentiellement
//! lossy : chaque lecture peut renvoyer `NotFound`, chaque écriture peut échouer, et les
//! appelants décident au cas par cas si l'erreur est fatale.

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::CryptoError;

pub mod fs;
pub mod s3;
pub mod session;

pub use fs::DirectoryStore;
pub use s3::{S3Store, S3StoreConfig};
pub use session::{Decrypt, Encrypt, GetOptions, Profile, PutOptions, Session};

/// Erreurs du stockage distant.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("signature verification failed for {0}")]
    Verify(String),
    #[error("unable to decrypt {path}: {source}")]
    Decrypt {
        path: String,
        #[source]
        source: CryptoError,
    },
    #[error("unable to encrypt content: {0}")]
    Encrypt(#[source] CryptoError),
    #[error("remote I/O error: {0}")]
    Io(String),
    #[error("remote backend error: {0}")]
    Backend(String),
    #[error("unable to locate user: {0}")]
    UnknownUser(String),
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
}

impl RemoteError {
    /// Vrai pour les erreurs qui signifient « ressource inutilisable par ce principal ».
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RemoteError::NotFound(_) | RemoteError::Verify(_) | RemoteError::Decrypt { .. }
        )
    }
}

/// Primitives brutes d'un hub de blobs : un espace (« bucket ») par nom d'utilisateur.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Lit un objet ; `Ok(None)` s'il n'existe pas.
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Supprime un objet ; un objet déjà absent n'est pas une erreur.
    async fn delete(&self, bucket: &str, path: &str) -> Result<(), RemoteError>;

    /// Liste les chemins (relatifs au bucket) de tous les objets.
    async fn list(&self, bucket: &str) -> Result<Vec<String>, RemoteError>;
}

pub(crate) fn validate_path(path: &str) -> Result<(), RemoteError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(RemoteError::InvalidPath(path.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        assert!(validate_path("videos/abc.index").is_ok());
        assert!(validate_path("share/xyz/master-index").is_ok());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("a//b").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn unavailable_classification() {
        assert!(RemoteError::NotFound("x".into()).is_unavailable());
        assert!(RemoteError::Verify("x".into()).is_unavailable());
        assert!(!RemoteError::Backend("x".into()).is_unavailable());
    }
}
