use thiserror::Error;

use crate::cache::CacheError;
use crate::crypto::CryptoError;
use crate::remote::RemoteError;

/// Erreur de haut niveau des opérations de synchronisation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Opération invalide dans ce contexte ; jamais réessayée.
    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    KeyUnavailable(String),

    #[error("{0}")]
    NotSignedIn(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Vrai si la ressource elle-même est inutilisable, par opposition à une panne passagère.
    pub fn is_unavailable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_unavailable(),
            SyncError::Serialization(_) | SyncError::KeyUnavailable(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
