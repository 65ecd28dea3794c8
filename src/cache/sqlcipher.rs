use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hkdf::Hkdf;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{CacheCursor, CacheEntry, CacheError, CachePage, ShareFilter};
use crate::crypto::{CryptoError, DerivedKey};
use crate::index::Timestamp;

const DB_KEY_INFO: &[u8] = b"aether-sync:sqlcipher-key:v1";
const SCHEMA_VERSION: u32 = 1;
const DB_KEY_LEN: usize = 32;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cached_indexes (
        id TEXT PRIMARY KEY,
        section TEXT NOT NULL,
        data BLOB NOT NULL,
        last_updated INTEGER,
        share_name TEXT
    );
    CREATE INDEX IF NOT EXISTS cached_indexes_section ON cached_indexes (section);
    CREATE INDEX IF NOT EXISTS cached_indexes_last_updated ON cached_indexes (last_updated);
";

const SELECT_COLUMNS: &str = "id, section, data, last_updated, share_name";

/// Cache local persistant basé sur SQLCipher.
///
/// La clé de la base est dérivée de la clé de cache de l'identité via HKDF-SHA256 ;
/// une base illisible avec cette clé est supprimée puis recréée (ce n'est qu'un cache).
pub struct CacheStore {
    conn: Connection,
    path: PathBuf,
}

impl CacheStore {
    /// Ouvre ou crée la base chiffrée.
    ///
    /// # Arguments
    /// * `db_path` - Chemin du fichier SQLite à créer/ouvrir.
    /// * `cache_key` - Clé de cache de l'identité, d'où est dérivée la clé SQLCipher.
    pub fn open<P: AsRef<Path>>(db_path: P, cache_key: &DerivedKey) -> Result<Self, CacheError> {
        let hkdf = Hkdf::<Sha256>::new(None, cache_key.as_bytes());
        let mut db_key = Zeroizing::new([0u8; DB_KEY_LEN]);
        hkdf.expand(DB_KEY_INFO, &mut db_key[..]).map_err(|_| {
            log::error!("CacheStore::open: HKDF expansion failed");
            CryptoError::HkdfLength
        })?;
        let key_pragma = Zeroizing::new(format!("x'{}'", hex::encode(&db_key[..])));

        let path = db_path.as_ref().to_path_buf();
        log::info!("CacheStore::open: Opening database at {}", path.to_string_lossy());

        if path.exists() {
            match Self::probe(&path, &key_pragma) {
                Ok(()) => log::info!("CacheStore::open: Existing database opened successfully"),
                Err(e) => {
                    // Clé différente (autre identité) ou base corrompue : on repart de zéro.
                    log::warn!("CacheStore::open: Database key mismatch or corruption: {}, removing file", e);
                    std::fs::remove_file(&path)?;
                }
            }
        } else {
            log::info!("CacheStore::open: Database file does not exist, will create new one");
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "key", key_pragma.as_str())?;
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self { conn, path })
    }

    /// Vérifie qu'une base existante s'ouvre avec la clé et que la table est lisible.
    fn probe(path: &Path, key_pragma: &str) -> rusqlite::Result<()> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "key", key_pragma)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        let table_exists = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='cached_indexes'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .is_some();
        if table_exists {
            conn.query_row("SELECT COUNT(*) FROM cached_indexes", [], |_| Ok(()))?;
        }
        Ok(())
    }

    /// Insère ou remplace l'entrée de même identifiant.
    pub fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO cached_indexes (id, section, data, last_updated, share_name)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id,
                entry.section,
                entry.data,
                entry.last_updated,
                entry.share_name
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM cached_indexes WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Supprime une entrée ; renvoie `false` si elle n'existait pas.
    pub fn delete(&self, id: &str) -> Result<bool, CacheError> {
        let removed = self
            .conn
            .execute("DELETE FROM cached_indexes WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }

    /// `id -> last_updated` des entrées d'une section visibles dans la vue `filter`.
    pub fn stamps_in_section(
        &self,
        section: &str,
        filter: ShareFilter<'_>,
    ) -> Result<HashMap<String, Option<Timestamp>>, CacheError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, last_updated, share_name FROM cached_indexes WHERE section = ?1",
        )?;
        let rows = stmt.query_map([section], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<Timestamp>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut stamps = HashMap::new();
        for row in rows {
            let (id, last_updated, share_name) = row?;
            if filter.matches(share_name.as_deref()) {
                stamps.insert(id, last_updated);
            }
        }
        Ok(stamps)
    }

    /// Parcours d'une section par `last_updated` décroissant (puis `id` décroissant).
    ///
    /// Les entrées sans `last_updated` ne sont pas indexées et n'apparaissent jamais ici.
    /// `max = None` renvoie tout ; sinon `next` désigne la première entrée de la page suivante.
    pub fn entries(
        &self,
        section: &str,
        filter: ShareFilter<'_>,
        max: Option<usize>,
        cursor: Option<&CacheCursor>,
    ) -> Result<CachePage, CacheError> {
        let mut page = CachePage::default();
        if max == Some(0) {
            return Ok(page);
        }

        let base = format!(
            "SELECT {SELECT_COLUMNS} FROM cached_indexes
             WHERE section = ?1 AND last_updated IS NOT NULL"
        );
        let order = "ORDER BY last_updated DESC, id DESC";
        let mut stmt;
        let mut rows = match cursor {
            Some(cursor) => {
                stmt = self.conn.prepare(&format!(
                    "{base} AND (last_updated < ?2 OR (last_updated = ?2 AND id <= ?3)) {order}"
                ))?;
                stmt.query(params![section, cursor.last_updated, cursor.id])?
            }
            None => {
                stmt = self.conn.prepare(&format!("{base} {order}"))?;
                stmt.query(params![section])?
            }
        };

        while let Some(row) = rows.next()? {
            let entry = entry_from_row(row)?;
            if !filter.matches(entry.share_name.as_deref()) {
                continue;
            }
            if max.is_some_and(|m| page.entries.len() >= m) {
                if let Some(last_updated) = entry.last_updated {
                    page.next = Some(CacheCursor {
                        last_updated,
                        id: entry.id,
                    });
                }
                break;
            }
            page.entries.push(entry);
        }
        Ok(page)
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cached_indexes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Ferme la connexion et supprime le fichier de base.
    pub fn destroy(self) -> Result<(), CacheError> {
        let CacheStore { conn, path } = self;
        if let Err((_, e)) = conn.close() {
            log::warn!("CacheStore::destroy: close failed: {}", e);
        }
        Self::remove_file(&path)
    }

    /// Supprime une base fermée ; un fichier absent n'est pas une erreur.
    pub fn remove_file(path: &Path) -> Result<(), CacheError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                log::info!("CacheStore::remove_file: removed {}", path.to_string_lossy());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        id: row.get(0)?,
        section: row.get(1)?,
        data: row.get(2)?,
        last_updated: row.get(3)?,
        share_name: row.get(4)?,
    })
}
