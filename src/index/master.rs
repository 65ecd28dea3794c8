use serde::{Deserialize, Serialize};

use super::{
    addressing::is_recognized_index, share_root, FileEntry, MasterIndex,
    ResourceMetadata, INTERNAL_INDEX, MASTER_INDEX,
};
use crate::error::{Result, SyncError};
use crate::index::GroupShareManager;
use crate::keys::KeyManager;
use crate::remote::session::public_key_from_hex;
use crate::remote::{BlobStore, Encrypt, GetOptions, PutOptions, RemoteError, Session};
use crate::worker::{CommandSink, WorkerRequest};

/// Opération appliquée à l'index maître.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Add,
    Update,
    Delete,
    Share,
    Unshare,
}

impl FileOperation {
    fn removes(self) -> bool {
        matches!(self, FileOperation::Delete | FileOperation::Unshare)
    }

    fn touches_keys(self) -> bool {
        matches!(
            self,
            FileOperation::Share | FileOperation::Unshare | FileOperation::Delete
        )
    }

    fn fans_out(self) -> bool {
        matches!(self, FileOperation::Delete | FileOperation::Update)
    }
}

/// Destinataire d'un partage et choix de l'utilisateur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareUserEntry {
    pub user_name: String,
    pub share: bool,
}

/// Écriture de clé différée, appliquée une fois l'index écrit.
enum KeyWrite {
    Grant { path: String, content: Vec<u8> },
    Revoke { id: String, resource_type: String },
}

/// Lecture/écriture de l'index maître, pour le principal et pour chaque partage.
pub struct MasterIndexStore<'a, S: BlobStore> {
    session: &'a Session<S>,
    file_types: &'a [String],
}

impl<'a, S: BlobStore> MasterIndexStore<'a, S> {
    pub fn new(session: &'a Session<S>, file_types: &'a [String]) -> Self {
        Self {
            session,
            file_types,
        }
    }

    /// Index maître d'une portée, `None` s'il est absent, illisible ou malformé.
    ///
    /// Pour un partage, la copie a été chiffrée pour nous par le propriétaire : pas de
    /// vérification de signature, la possession de la clé de déchiffrement fait foi.
    pub async fn load(&self, scope_root: &str, acting_user: Option<&str>) -> Option<MasterIndex> {
        let file_name = format!("{scope_root}{MASTER_INDEX}");
        let content = match acting_user {
            Some(user) => match self
                .session
                .get_file(&file_name, GetOptions::raw(Some(user)))
                .await
            {
                Ok(encrypted) => self.session.decrypt_content(&encrypted, None),
                Err(e) => Err(e),
            },
            None => self.session.get_file(&file_name, GetOptions::private()).await,
        };

        match content {
            Ok(json) => {
                let index = MasterIndex::from_json(&json);
                if index.is_none() {
                    log::warn!("MasterIndexStore::load: {} is malformed", file_name);
                }
                index
            }
            Err(e) => {
                log::debug!("MasterIndexStore::load: {} unavailable: {}", file_name, e);
                None
            }
        }
    }

    /// Construit l'index à partir des fichiers `.index` reconnus, tous à horodatage inconnu.
    ///
    /// Après écriture, l'index est relu (déchiffrement + signature). En cas d'échec le
    /// fichier est supprimé et réécrit une seule fois.
    pub async fn create(&self, scope_root: &str) -> Result<MasterIndex> {
        let index: MasterIndex = self
            .session
            .list_files()
            .await?
            .into_iter()
            .filter_map(|name| {
                let relative = name.strip_prefix(scope_root)?;
                is_recognized_index(relative, self.file_types).then(|| (name, None))
            })
            .collect();

        let file_name = format!("{scope_root}{MASTER_INDEX}");
        log::info!(
            "MasterIndexStore::create: writing {} with {} entries",
            file_name,
            index.len()
        );

        if let Err(e) = self.write_verified(&file_name, &index).await {
            log::warn!("MasterIndexStore::create: {} failed verification ({}), recreating", file_name, e);
            self.session.delete_file(&file_name).await?;
            self.write_verified(&file_name, &index).await?;
        }
        Ok(index)
    }

    async fn write_verified(&self, file_name: &str, index: &MasterIndex) -> Result<()> {
        self.session
            .put_file(file_name, &index.to_json(), PutOptions::private())
            .await?;
        let stored = self
            .session
            .get_file(file_name, GetOptions::private())
            .await?;
        if MasterIndex::from_json(&stored).as_ref() != Some(index) {
            return Err(RemoteError::Verify(file_name.to_string()).into());
        }
        Ok(())
    }

    /// Charge l'index maître du principal, en le créant s'il manque ou ne se vérifie pas.
    pub async fn ensure_own(&self) -> Result<MasterIndex> {
        match self.load("", None).await {
            Some(index) => Ok(index),
            None => self.create("").await,
        }
    }

    /// Écrit l'index (chiffré + signé). Un échec est journalisé et renvoie `false` :
    /// la réconciliation suivante refera le travail.
    pub async fn save(&self, scope_root: &str, index: &MasterIndex) -> bool {
        let file_name = format!("{scope_root}{MASTER_INDEX}");
        match self
            .session
            .put_file(&file_name, &index.to_json(), PutOptions::private())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                log::error!("MasterIndexStore::save: unable to write {}: {}", file_name, e);
                false
            }
        }
    }

    /// Applique `operation` aux entrées, pour le principal ou pour le partage `user_name`.
    ///
    /// Une suppression ou une mise à jour sur l'index du principal est répercutée sur
    /// chaque partage connu. La commande de cache correspondante est ensuite soumise à `sink`.
    pub async fn update(
        &self,
        operation: FileOperation,
        entries: &[FileEntry],
        user_name: Option<&str>,
        sink: Option<&dyn CommandSink>,
    ) -> Result<()> {
        let result = self.update_all_scopes(operation, entries, user_name).await;
        if let Some(sink) = sink {
            dispatch(operation, entries, sink);
        }
        result
    }

    async fn update_all_scopes(
        &self,
        operation: FileOperation,
        entries: &[FileEntry],
        user_name: Option<&str>,
    ) -> Result<()> {
        if let Some(user) = user_name {
            if matches!(operation, FileOperation::Add) {
                let msg = format!(
                    "Invalid operation for user name: {user}.  Only share and unshare operations are allowed"
                );
                log::error!("MasterIndexStore::update: {}", msg);
                return Err(SyncError::Configuration(msg));
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        let modified = self.update_scope(operation, entries, user_name).await?;
        if user_name.is_none() && modified && operation.fans_out() {
            let shares = GroupShareManager::new(self.session).load_shares().await;
            for share in shares.values() {
                if let Err(e) = self.update_scope(operation, entries, Some(share)).await {
                    log::warn!(
                        "MasterIndexStore::update: propagation of {:?} to {} failed: {}",
                        operation,
                        share,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    /// Met à jour une seule portée ; renvoie vrai si l'index a changé.
    async fn update_scope(
        &self,
        operation: FileOperation,
        entries: &[FileEntry],
        user_name: Option<&str>,
    ) -> Result<bool> {
        let grantee = match user_name {
            Some(user) => Some(self.session.lookup_public_key(Some(user)).await?),
            None => None,
        };
        let root = grantee.as_deref().map(share_root).unwrap_or_default();
        let file_name = match grantee {
            Some(_) => format!("{root}{INTERNAL_INDEX}"),
            None => MASTER_INDEX.to_string(),
        };

        let mut index = match self
            .session
            .get_file(&file_name, GetOptions::private())
            .await
        {
            Ok(json) => MasterIndex::from_json(&json).unwrap_or_default(),
            Err(RemoteError::NotFound(_)) if operation != FileOperation::Delete => MasterIndex::new(),
            Err(RemoteError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let keys = KeyManager::new(self.session);
        let mut modified = false;
        let mut key_writes = Vec::new();
        for entry in entries {
            let changed = if operation.removes() {
                index.remove(&entry.index_file)
            } else if operation != FileOperation::Update || index.contains(&entry.index_file) {
                index.insert(entry.index_file.clone(), entry.metadata.last_updated_utc);
                true
            } else {
                false
            };
            modified |= changed;

            let Some(grantee) = grantee.as_deref().filter(|_| changed && operation.touches_keys())
            else {
                continue;
            };
            let metadata = &entry.metadata;
            if operation == FileOperation::Share {
                // Toutes les clés sont préparées avant la moindre écriture.
                let (path, content) = keys
                    .prepare_grant(&metadata.id, &metadata.resource_type, grantee)
                    .await?;
                key_writes.push(KeyWrite::Grant { path, content });
            } else {
                key_writes.push(KeyWrite::Revoke {
                    id: metadata.id.clone(),
                    resource_type: metadata.resource_type.clone(),
                });
            }
        }

        let json = index.to_json();
        if modified {
            self.session
                .put_file(&file_name, &json, PutOptions::private())
                .await?;
            for write in key_writes {
                let (target, result) = match write {
                    KeyWrite::Grant { path, content } => {
                        let result = self
                            .session
                            .put_file(&path, &content, PutOptions::raw())
                            .await
                            .map_err(SyncError::from);
                        (path, result)
                    }
                    KeyWrite::Revoke { id, resource_type } => {
                        let grantee = grantee.as_deref().unwrap_or_default();
                        let result = keys.revoke_share(&id, &resource_type, grantee).await;
                        (format!("{resource_type}/{id}"), result)
                    }
                };
                if let Err(e) = result {
                    log::warn!("MasterIndexStore::update: key for {} not updated: {}", target, e);
                }
            }
        }

        if let Some(grantee) = grantee.as_deref() {
            let recipient = public_key_from_hex(grantee)?;
            self.session
                .put_file(
                    &format!("{root}{MASTER_INDEX}"),
                    &json,
                    PutOptions {
                        encrypt: Encrypt::ForPublicKey(&recipient),
                        sign: false,
                    },
                )
                .await?;
        }

        log::info!(
            "MasterIndexStore::update: {:?} on {} ({} entries, modified={})",
            operation,
            file_name,
            entries.len(),
            modified
        );
        Ok(modified)
    }

    /// Partage (ou retire) des ressources avec chaque utilisateur coché.
    pub async fn share_files(
        &self,
        resources: &[ResourceMetadata],
        users: &[ShareUserEntry],
        unshare: bool,
    ) -> Result<()> {
        let entries: Vec<FileEntry> = resources.iter().cloned().map(FileEntry::from).collect();
        let operation = if unshare {
            FileOperation::Unshare
        } else {
            FileOperation::Share
        };
        for user in users.iter().filter(|u| u.share) {
            self.update(operation, &entries, Some(&user.user_name), None)
                .await?;
        }
        Ok(())
    }
}

/// Commande de cache à exécuter après une mise à jour de l'index.
fn dispatch(operation: FileOperation, entries: &[FileEntry], sink: &dyn CommandSink) {
    match operation {
        FileOperation::Delete => {
            for entry in entries {
                sink.submit(WorkerRequest::RemoveCache {
                    index_file: entry.index_file.clone(),
                });
            }
        }
        FileOperation::Update => {
            for entry in entries {
                sink.submit(WorkerRequest::UpdateCache {
                    index_file: entry.index_file.clone(),
                });
            }
        }
        FileOperation::Add => sink.submit(WorkerRequest::CacheIndexes {
            index_files: entries.iter().map(|e| e.index_file.clone()).collect(),
        }),
        FileOperation::Share | FileOperation::Unshare => {}
    }
}
