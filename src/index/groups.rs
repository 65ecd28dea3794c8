use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use super::{
    group_index_path, index_file_path, Group, GroupIndex, MissingGroupEntry, ResourceMetadata,
    ShareIndex, GROUP_INDEX, SELECTED_GROUP, SELECTED_SHARES, SHARE_INDEX,
};
use crate::error::Result;
use crate::remote::{BlobStore, GetOptions, PutOptions, RemoteError, Session};

/// Index des partages, des groupes et des préférences de vue associées.
///
/// Tous ces documents sont privés (chiffrés + signés). En lecture seule, un document
/// absent ou illisible vaut une collection vide. Avant une réécriture, seuls l'absence
/// et un JSON invalide valent une collection vide : toute autre erreur est propagée.
pub struct GroupShareManager<'a, S: BlobStore> {
    session: &'a Session<S>,
}

impl<'a, S: BlobStore> GroupShareManager<'a, S> {
    pub fn new(session: &'a Session<S>) -> Self {
        Self { session }
    }

    async fn read_private<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, RemoteError> {
        let json = self.session.get_file(path, GetOptions::private()).await?;
        serde_json::from_slice(&json)
            .map_err(|e| RemoteError::Backend(format!("malformed {path}: {e}")))
    }

    async fn read_or_default<T: DeserializeOwned + Default>(&self, path: &str) -> T {
        match self.read_private(path).await {
            Ok(value) => value,
            Err(e) => {
                log::debug!("GroupShareManager: {} unavailable, using empty: {}", path, e);
                T::default()
            }
        }
    }

    async fn read_for_update<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        let json = match self.session.get_file(path, GetOptions::private()).await {
            Ok(json) => json,
            Err(RemoteError::NotFound(_)) => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&json).unwrap_or_else(|e| {
            log::warn!("GroupShareManager: malformed {}, rewriting from empty: {}", path, e);
            T::default()
        }))
    }

    async fn write_private<T: serde::Serialize>(&self, path: &str, value: &T) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        self.session
            .put_file(path, &json, PutOptions::private())
            .await?;
        Ok(())
    }

    pub async fn load_shares(&self) -> ShareIndex {
        self.read_or_default(SHARE_INDEX).await
    }

    /// Ajoute (ou retire) des utilisateurs de l'index des partages ; clés en minuscules.
    pub async fn update_shares(&self, user_names: &[String], delete: bool) -> Result<()> {
        let mut shares: ShareIndex = self.read_for_update(SHARE_INDEX).await?;
        for user_name in user_names {
            if delete {
                shares.remove(&user_name.to_lowercase());
            } else {
                shares.insert(user_name.to_lowercase(), user_name.clone());
            }
        }
        self.write_private(SHARE_INDEX, &shares).await
    }

    pub async fn load_groups(&self) -> BTreeMap<String, Group> {
        self.read_or_default(GROUP_INDEX).await
    }

    pub async fn load_group(&self, id: &str) -> Option<Group> {
        self.load_groups().await.remove(id)
    }

    /// Enregistre (ou supprime) un groupe.
    ///
    /// L'index de membres du groupe est toujours supprimé : il est recréé entièrement
    /// par les ajouts suivants.
    pub async fn update_group(&self, group: &Group, delete: bool) -> Result<()> {
        let mut groups: BTreeMap<String, Group> = self.read_for_update(GROUP_INDEX).await?;
        if delete {
            groups.remove(&group.id);
        } else {
            groups.insert(group.id.clone(), group.clone());
        }

        if let Err(e) = self.session.delete_file(&group_index_path(&group.id)).await {
            log::debug!("GroupShareManager::update_group: no index to delete for {}: {}", group.id, e);
        }
        self.write_private(GROUP_INDEX, &groups).await
    }

    pub async fn load_group_index(&self, group_id: &str) -> GroupIndex {
        self.read_or_default(&group_index_path(group_id)).await
    }

    pub async fn save_group_index(&self, group_id: &str, index: &GroupIndex) -> bool {
        match self.write_private(&group_index_path(group_id), index).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("GroupShareManager::save_group_index: {}: {}", group_id, e);
                false
            }
        }
    }

    /// Ajoute des ressources à chaque groupe, avec leur propriétaire.
    pub async fn add_members(
        &self,
        resources: &[ResourceMetadata],
        group_ids: &[String],
    ) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        for group_id in group_ids {
            let path = group_index_path(group_id);
            let mut index: GroupIndex = self.read_for_update(&path).await?;
            for metadata in resources {
                index.insert(metadata.index_file(), metadata.user_name.clone());
            }
            self.write_private(&path, &index).await?;
        }
        Ok(())
    }

    pub async fn remove_members(&self, resources: &[ResourceMetadata], group_id: &str) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        let path = group_index_path(group_id);
        let mut index: GroupIndex = self.read_for_update(&path).await?;
        for metadata in resources {
            index.remove(&index_file_path(&metadata.resource_type, &metadata.id));
        }
        self.write_private(&path, &index).await
    }

    /// Retire de l'index du groupe les entrées dont la ressource n'existe plus.
    ///
    /// Test d'existence brut (sans déchiffrement) dans le bucket du propriétaire ; une
    /// entrée simplement pas encore synchronisée est conservée. Renvoie le nombre
    /// d'entrées retirées.
    pub async fn validate_group_entries(
        &self,
        group_id: &str,
        missing: &[MissingGroupEntry],
    ) -> usize {
        if group_id.is_empty() || missing.is_empty() {
            return 0;
        }
        let mut index: GroupIndex = match self.read_for_update(&group_index_path(group_id)).await {
            Ok(index) => index,
            Err(e) => {
                log::warn!("GroupShareManager::validate_group_entries: {} unreadable: {}", group_id, e);
                return 0;
            }
        };
        let mut pruned = 0;
        for candidate in missing {
            let found = match self
                .session
                .file_exists(&candidate.index_file, candidate.user_name.as_deref())
                .await
            {
                Ok(found) => found,
                Err(e) => {
                    log::debug!(
                        "GroupShareManager::validate_group_entries: {} unreachable: {}",
                        candidate.index_file,
                        e
                    );
                    false
                }
            };
            if !found && index.remove(&candidate.index_file).is_some() {
                pruned += 1;
            }
        }

        if pruned > 0 {
            log::info!(
                "GroupShareManager::validate_group_entries: pruned {} entries from group {}",
                pruned,
                group_id
            );
            self.save_group_index(group_id, &index).await;
        }
        pruned
    }

    /// Partages sélectionnés pour l'affichage ; `None` si aucun.
    ///
    /// Le document est créé vide s'il n'existe pas encore.
    pub async fn selected_shares(&self) -> Option<Vec<String>> {
        let selected: Vec<String> = match self.read_private(SELECTED_SHARES).await {
            Ok(selected) => selected,
            Err(_) => {
                self.save_selected_shares(&[]).await;
                Vec::new()
            }
        };
        (!selected.is_empty()).then_some(selected)
    }

    pub async fn save_selected_shares(&self, selected: &[String]) {
        if let Err(e) = self.write_private(SELECTED_SHARES, &selected).await {
            log::error!("GroupShareManager::save_selected_shares: {}", e);
        }
    }

    /// Groupe sélectionné pour l'affichage ; le document est créé vide s'il manque.
    pub async fn selected_group(&self) -> Option<String> {
        match self
            .session
            .get_file(SELECTED_GROUP, GetOptions::private())
            .await
        {
            Ok(text) => Some(String::from_utf8_lossy(&text).into_owned()).filter(|g| !g.is_empty()),
            Err(_) => {
                self.save_selected_group(None).await;
                None
            }
        }
    }

    pub async fn save_selected_group(&self, group_id: Option<&str>) {
        let content = group_id.unwrap_or_default();
        if let Err(e) = self
            .session
            .put_file(SELECTED_GROUP, content.as_bytes(), PutOptions::private())
            .await
        {
            log::error!("GroupShareManager::save_selected_group: {}", e);
        }
    }
}
