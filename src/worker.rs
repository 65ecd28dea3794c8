//! Protocole de commandes du worker de synchronisation.
//!
//! Les commandes sont des messages JSON traités un par un, dans l'ordre d'arrivée :
//! aucune réconciliation ne partage la connexion au cache avec une autre commande.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::CacheStore;
use crate::error::{Result, SyncError};
use crate::index::{GroupShareManager, MissingGroupEntry};
use crate::remote::{BlobStore, Session};
use crate::sync::SyncEngine;

const NOT_SIGNED_IN: &str = "Unable to load data because the session is not signed in.";
const CACHE_INDEXES_FAILED: &str = "Unable to add index to cache.";
const REMOVE_CACHE_FAILED: &str = "Unable to delete cached index.";
const UPDATE_CACHE_FAILED: &str = "Unable to update cached index.";

/// Commande reçue par le worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum WorkerRequest {
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "cacheindexes")]
    CacheIndexes {
        #[serde(rename = "indexFiles", default)]
        index_files: Vec<String>,
    },
    #[serde(rename = "removecache")]
    RemoveCache {
        #[serde(rename = "indexFile", default)]
        index_file: String,
    },
    #[serde(rename = "updatecache")]
    UpdateCache {
        #[serde(rename = "indexFile", default)]
        index_file: String,
    },
    #[serde(rename = "deletedb")]
    DeleteDb,
    #[serde(rename = "validate-group-entries")]
    ValidateGroupEntries {
        #[serde(rename = "groupid", default)]
        group_id: String,
        #[serde(default)]
        missing: Vec<MissingGroupEntry>,
    },
}

enum ParseError {
    Unknown,
    Invalid(&'static str),
}

impl WorkerRequest {
    fn parse(value: Value) -> std::result::Result<Self, ParseError> {
        let failure = match value.get("message").and_then(Value::as_str) {
            Some("load") | Some("deletedb") | Some("validate-group-entries") => "invalid request",
            Some("cacheindexes") => CACHE_INDEXES_FAILED,
            Some("removecache") => REMOVE_CACHE_FAILED,
            Some("updatecache") => UPDATE_CACHE_FAILED,
            _ => return Err(ParseError::Unknown),
        };
        serde_json::from_value(value).map_err(|e| {
            log::warn!("WorkerRequest::parse: malformed request: {}", e);
            ParseError::Invalid(failure)
        })
    }
}

/// Réponse émise pour chaque commande.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub message: String,
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_existing: Option<bool>,
}

impl WorkerResponse {
    pub fn ready() -> Self {
        Self::complete("ready")
    }

    pub fn complete(message: &str) -> Self {
        Self {
            message: message.to_string(),
            result: true,
            added_count: None,
            has_existing: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result: false,
            added_count: None,
            has_existing: None,
        }
    }

    pub fn load_complete(added_count: usize, has_existing: bool) -> Self {
        Self {
            added_count: Some(added_count),
            has_existing: Some(has_existing),
            ..Self::complete("loadcomplete")
        }
    }
}

/// File de commandes exposée au cœur pour les effets différés (mises à jour de cache
/// consécutives à une modification d'index, validation de groupe).
pub trait CommandSink {
    fn submit(&self, request: WorkerRequest);
}

impl CommandSink for mpsc::UnboundedSender<Value> {
    fn submit(&self, request: WorkerRequest) {
        let value = match serde_json::to_value(&request) {
            Ok(value) => value,
            Err(e) => {
                log::error!("CommandSink::submit: unable to encode {:?}: {}", request, e);
                return;
            }
        };
        if self.send(value).is_err() {
            log::warn!("CommandSink::submit: worker channel closed, dropping {:?}", request);
        }
    }
}

/// File en mémoire, pour un hôte mono-tâche qui draine lui-même les commandes.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queue: Mutex<VecDeque<WorkerRequest>>,
}

impl CommandQueue {
    pub fn pop(&self) -> Option<WorkerRequest> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn drain(&self) -> Vec<WorkerRequest> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl CommandSink for CommandQueue {
    fn submit(&self, request: WorkerRequest) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Busy,
}

/// État explicite du worker : session, connexion au cache et configuration.
pub struct WorkerContext<S: BlobStore> {
    session: Option<Session<S>>,
    cache: Option<CacheStore>,
    db_path: PathBuf,
    file_types: Vec<String>,
}

impl<S: BlobStore> WorkerContext<S> {
    pub fn new(session: Option<Session<S>>, db_path: PathBuf, file_types: Vec<String>) -> Self {
        Self {
            session,
            cache: None,
            db_path,
            file_types,
        }
    }

    /// Session, cache (ouvert à la demande) et types reconnus.
    fn signed_in(&mut self) -> Result<(&Session<S>, &CacheStore, &[String])> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SyncError::NotSignedIn(NOT_SIGNED_IN.to_string()))?;
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => CacheStore::open(&self.db_path, session.identity().cache_key())?,
        };
        let cache: &CacheStore = self.cache.insert(cache);
        Ok((session, cache, self.file_types.as_slice()))
    }
}

pub struct Worker<S: BlobStore> {
    context: WorkerContext<S>,
    state: WorkerState,
}

impl<S: BlobStore> Worker<S> {
    pub fn new(context: WorkerContext<S>) -> Self {
        Self {
            context,
            state: WorkerState::Uninitialized,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Signal de démarrage, émis une seule fois avant toute commande.
    pub fn start(&mut self) -> WorkerResponse {
        self.state = WorkerState::Ready;
        log::info!("Worker::start: ready");
        WorkerResponse::ready()
    }

    /// Traite un message brut ; ne panique jamais sur une commande invalide.
    pub async fn handle(&mut self, message: Value) -> WorkerResponse {
        match WorkerRequest::parse(message) {
            Ok(request) => self.execute(request).await,
            Err(ParseError::Unknown) => WorkerResponse::failure("unknown"),
            Err(ParseError::Invalid(failure)) => WorkerResponse::failure(failure),
        }
    }

    pub async fn execute(&mut self, request: WorkerRequest) -> WorkerResponse {
        self.state = WorkerState::Busy;
        log::debug!("Worker::execute: {:?}", request);

        let response = match request {
            WorkerRequest::Load => self.load().await,
            WorkerRequest::CacheIndexes { index_files } => {
                self.cache_indexes(&index_files).await
            }
            WorkerRequest::RemoveCache { index_file } => self.remove_cache(&index_file),
            WorkerRequest::UpdateCache { index_file } => self.update_cache(&index_file).await,
            WorkerRequest::DeleteDb => self.delete_db(),
            WorkerRequest::ValidateGroupEntries { group_id, missing } => {
                self.validate_group_entries(&group_id, &missing).await
            }
        };

        self.state = WorkerState::Ready;
        if !response.result {
            log::warn!("Worker::execute: {}", response.message);
        }
        response
    }

    async fn load(&mut self) -> WorkerResponse {
        let (session, cache, file_types) = match self.context.signed_in() {
            Ok(parts) => parts,
            Err(e) => return WorkerResponse::failure(e.to_string()),
        };
        match SyncEngine::new(session, cache, file_types).load().await {
            Ok(report) => {
                WorkerResponse::load_complete(report.own.synced, report.own.had_previous_entries)
            }
            Err(e) => WorkerResponse::failure(e.to_string()),
        }
    }

    async fn cache_indexes(&mut self, index_files: &[String]) -> WorkerResponse {
        if index_files.is_empty() {
            return WorkerResponse::failure(CACHE_INDEXES_FAILED);
        }
        let (session, cache, file_types) = match self.context.signed_in() {
            Ok(parts) => parts,
            Err(_) => return WorkerResponse::failure(CACHE_INDEXES_FAILED),
        };
        match SyncEngine::new(session, cache, file_types)
            .add_indexes_to_cache(index_files)
            .await
        {
            Ok(_) => WorkerResponse::complete("cacheindexescomplete"),
            Err(e) => WorkerResponse::failure(e.to_string()),
        }
    }

    fn remove_cache(&mut self, index_file: &str) -> WorkerResponse {
        if index_file.is_empty() {
            return WorkerResponse::failure(REMOVE_CACHE_FAILED);
        }
        let (session, cache, file_types) = match self.context.signed_in() {
            Ok(parts) => parts,
            Err(_) => return WorkerResponse::failure(REMOVE_CACHE_FAILED),
        };
        match SyncEngine::new(session, cache, file_types).remove_cached_index(index_file) {
            Ok(_) => WorkerResponse::complete("removecachecomplete"),
            Err(e) => WorkerResponse::failure(e.to_string()),
        }
    }

    async fn update_cache(&mut self, index_file: &str) -> WorkerResponse {
        if index_file.is_empty() {
            return WorkerResponse::failure(UPDATE_CACHE_FAILED);
        }
        let (session, cache, file_types) = match self.context.signed_in() {
            Ok(parts) => parts,
            Err(_) => return WorkerResponse::failure(UPDATE_CACHE_FAILED),
        };
        match SyncEngine::new(session, cache, file_types)
            .update_cached_index(index_file)
            .await
        {
            Ok(true) => WorkerResponse::complete("updatecachecomplete"),
            Ok(false) => WorkerResponse::failure(UPDATE_CACHE_FAILED),
            Err(e) => WorkerResponse::failure(e.to_string()),
        }
    }

    /// Ferme et détruit le cache local ; toujours signalé comme terminé.
    fn delete_db(&mut self) -> WorkerResponse {
        let result = match self.context.cache.take() {
            Some(cache) => cache.destroy(),
            None => CacheStore::remove_file(&self.context.db_path),
        };
        if let Err(e) = result {
            log::error!("Worker::delete_db: Unable to delete cached indexes database: {}", e);
        }
        WorkerResponse::complete("deletedbcomplete")
    }

    async fn validate_group_entries(
        &mut self,
        group_id: &str,
        missing: &[MissingGroupEntry],
    ) -> WorkerResponse {
        match &self.context.session {
            Some(session) => {
                GroupShareManager::new(session)
                    .validate_group_entries(group_id, missing)
                    .await;
            }
            None => log::warn!("Worker::validate_group_entries: {}", NOT_SIGNED_IN),
        }
        WorkerResponse::complete("validate-group-entries-complete")
    }

    /// Exécute les commandes en attente dans `queue`, dans l'ordre.
    pub async fn drain(&mut self, queue: &CommandQueue) -> Vec<WorkerResponse> {
        let mut responses = Vec::new();
        while let Some(request) = queue.pop() {
            responses.push(self.execute(request).await);
        }
        responses
    }

    /// Boucle principale : `ready`, puis une réponse par message reçu, jusqu'à fermeture.
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Value>,
        outbox: mpsc::UnboundedSender<WorkerResponse>,
    ) {
        if outbox.send(self.start()).is_err() {
            return;
        }
        while let Some(message) = inbox.recv().await {
            let response = self.handle(message).await;
            if outbox.send(response).is_err() {
                log::info!("Worker::run: host disconnected");
                break;
            }
        }
        log::info!("Worker::run: inbox closed, stopping");
    }
}
