//! Cache local des index (collection `cached-indexes`).
//!
//! Un cache pur : chaque entrée peut être régénérée depuis le distant. Les données sont
//! scellées par [`crate::storage::seal_entry`] et la base elle-même est chiffrée par SQLCipher.

use thiserror::Error;

use crate::crypto::{CryptoError, DerivedKey};
use crate::index::Timestamp;
use crate::storage::{self, SealedBlob, StorageError};

pub mod sqlcipher;

pub use sqlcipher::CacheStore;

/// Erreurs du cache local.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache entry sealing error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Entrée de cache : miroir local rechiffré d'un document de métadonnées.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: String,
    /// `<clé publique du propriétaire>_<type>`.
    pub section: String,
    /// Document scellé ([`SealedBlob`] sérialisé).
    pub data: Vec<u8>,
    pub last_updated: Option<Timestamp>,
    /// Utilisateur pour le compte duquel l'entrée a été synchronisée.
    pub share_name: Option<String>,
}

impl CacheEntry {
    /// Scelle `plaintext` et construit l'entrée correspondante.
    pub fn seal(
        cache_key: &DerivedKey,
        id: String,
        section: String,
        plaintext: &[u8],
        last_updated: Option<Timestamp>,
        share_name: Option<String>,
    ) -> Result<Self, CacheError> {
        let data = storage::seal_entry(cache_key, plaintext, &id)?.to_bytes();
        Ok(Self {
            id,
            section,
            data,
            last_updated,
            share_name,
        })
    }

    /// Contenu en clair de l'entrée.
    pub fn open(&self, cache_key: &DerivedKey) -> Result<Vec<u8>, CacheError> {
        let blob = SealedBlob::from_bytes(&self.data)?;
        Ok(storage::open_entry(cache_key, &blob, &self.id)?)
    }
}

/// Position de reprise opaque dans un parcours par `lastUpdated` décroissant.
///
/// Désigne la prochaine entrée à renvoyer (incluse).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCursor {
    pub(crate) last_updated: Timestamp,
    pub(crate) id: String,
}

/// Une page de résultats et la position de la suivante, s'il en reste.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePage {
    pub entries: Vec<CacheEntry>,
    pub next: Option<CacheCursor>,
}

/// Filtre de vue sur le champ `share_name`.
#[derive(Debug, Clone, Copy)]
pub enum ShareFilter<'a> {
    /// Vue propre : entrées sans `share_name`.
    Own,
    /// Vue d'un seul partage (comparaison insensible à la casse).
    User(&'a str),
    /// Vue de plusieurs partages ; une liste vide ne retient rien.
    Users(&'a [String]),
}

impl ShareFilter<'_> {
    pub fn from_names(names: Option<&[String]>) -> ShareFilter<'_> {
        match names {
            Some(names) => ShareFilter::Users(names),
            None => ShareFilter::Own,
        }
    }

    pub fn from_user(user: Option<&str>) -> ShareFilter<'_> {
        match user {
            Some(user) => ShareFilter::User(user),
            None => ShareFilter::Own,
        }
    }

    pub fn matches(&self, share_name: Option<&str>) -> bool {
        match (self, share_name) {
            (ShareFilter::Own, None) => true,
            (ShareFilter::Own, Some(_)) => false,
            (_, None) => false,
            (ShareFilter::User(user), Some(name)) => user.eq_ignore_ascii_case(name),
            (ShareFilter::Users(users), Some(name)) => {
                users.iter().any(|u| u.eq_ignore_ascii_case(name))
            }
        }
    }
}
