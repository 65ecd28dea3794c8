//! Outils partagés par les tests : hub local instrumenté et ressources de test.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::cache::CacheStore;
use crate::crypto::IdentitySecret;
use crate::identity::IdentityContext;
use crate::index::{index_file_path, ResourceMetadata, Timestamp};
use crate::keys::{resource_public_key, KeyManager};
use crate::remote::{BlobStore, DirectoryStore, Encrypt, PutOptions, RemoteError, Session};

pub(crate) fn identity(user_name: &str, seed: u8) -> IdentityContext {
    IdentityContext::from_secret(user_name, &IdentitySecret::from_bytes([seed; 32])).unwrap()
}

pub(crate) fn file_types() -> Vec<String> {
    vec!["videos".to_string(), "images".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Get,
    Put,
    Delete,
    List,
}

/// État partagé du hub : journal des accès et pannes injectées.
#[derive(Debug, Default)]
struct HubState {
    log: Vec<(Op, String)>,
    failing_gets: HashSet<String>,
    corrupt_puts: HashMap<String, usize>,
}

type SharedState = Arc<Mutex<HubState>>;

/// `DirectoryStore` qui journalise chaque accès (`bucket/chemin`).
#[derive(Debug, Clone)]
pub(crate) struct CountingStore {
    inner: DirectoryStore,
    state: SharedState,
}

impl CountingStore {
    fn record(&self, op: Op, bucket: &str, path: &str) -> String {
        let object = format!("{bucket}/{path}");
        self.state.lock().unwrap().log.push((op, object.clone()));
        object
    }
}

#[async_trait]
impl BlobStore for CountingStore {
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let object = self.record(Op::Get, bucket, path);
        if self.state.lock().unwrap().failing_gets.contains(&object) {
            return Err(RemoteError::Io(format!("transient failure reading {object}")));
        }
        self.inner.get(bucket, path).await
    }

    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        let object = self.record(Op::Put, bucket, path);
        let corrupt = match self.state.lock().unwrap().corrupt_puts.get_mut(&object) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if corrupt {
            return self.inner.put(bucket, path, b"corrupted").await;
        }
        self.inner.put(bucket, path, data).await
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), RemoteError> {
        self.record(Op::Delete, bucket, path);
        self.inner.delete(bucket, path).await
    }

    async fn list(&self, bucket: &str) -> Result<Vec<String>, RemoteError> {
        self.record(Op::List, bucket, "");
        self.inner.list(bucket).await
    }
}

/// Hub partagé entre plusieurs sessions de test.
pub(crate) struct TestHub {
    dir: TempDir,
    state: SharedState,
}

impl TestHub {
    pub(crate) fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            state: SharedState::default(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn session(&self, user_name: &str, seed: u8) -> Session<CountingStore> {
        let store = CountingStore {
            inner: DirectoryStore::new(self.dir.path().join("hub")),
            state: Arc::clone(&self.state),
        };
        Session::new(store, identity(user_name, seed))
    }

    /// Les lectures de `object` (`bucket/chemin`) échouent jusqu'à `heal`.
    pub(crate) fn fail_reads_of(&self, object: &str) {
        self.state.lock().unwrap().failing_gets.insert(object.to_string());
    }

    pub(crate) fn heal(&self) {
        self.state.lock().unwrap().failing_gets.clear();
    }

    /// Les `count` prochaines écritures de `object` stockent un contenu altéré.
    pub(crate) fn corrupt_puts_of(&self, object: &str, count: usize) {
        self.state
            .lock()
            .unwrap()
            .corrupt_puts
            .insert(object.to_string(), count);
    }

    pub(crate) fn reset_counts(&self) {
        self.state.lock().unwrap().log.clear();
    }

    fn count(&self, op: Op, object: Option<&str>) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(o, path)| *o == op && object.map_or(true, |obj| path == obj))
            .count()
    }

    pub(crate) fn gets_of(&self, object: &str) -> usize {
        self.count(Op::Get, Some(object))
    }

    pub(crate) fn deletes_of(&self, object: &str) -> usize {
        self.count(Op::Delete, Some(object))
    }

    pub(crate) fn puts(&self) -> usize {
        self.count(Op::Put, None)
    }

    pub(crate) fn deletes(&self) -> usize {
        self.count(Op::Delete, None)
    }
}

/// Publie une ressource : clé privée, puis métadonnées chiffrées pour cette clé.
pub(crate) async fn publish_resource<S: BlobStore>(
    session: &Session<S>,
    resource_type: &str,
    id: &str,
    last_updated: Option<Timestamp>,
) -> ResourceMetadata {
    let key = KeyManager::new(session)
        .create_private_key(id, resource_type)
        .await
        .unwrap();
    let metadata = ResourceMetadata::new(resource_type, id, last_updated);
    let public_key = resource_public_key(&key);
    let options = PutOptions {
        encrypt: Encrypt::ForPublicKey(&public_key),
        sign: false,
    };
    session
        .put_file(
            &index_file_path(resource_type, id),
            &serde_json::to_vec(&metadata).unwrap(),
            options,
        )
        .await
        .unwrap();
    metadata
}

pub(crate) fn cache_store<S: BlobStore>(hub: &TestHub, session: &Session<S>) -> CacheStore {
    let db_path = hub
        .path()
        .join(format!("{}-cache.db", session.identity().user_name()));
    CacheStore::open(db_path, session.identity().cache_key()).unwrap()
}
