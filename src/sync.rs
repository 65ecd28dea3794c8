//! Réconciliation du cache local avec l'index maître distant.

use std::collections::{HashMap, HashSet};

use crate::cache::{CacheCursor, CacheEntry, CachePage, CacheStore, ShareFilter};
use crate::error::{Result, SyncError};
use crate::index::{
    index_id, resource_id_from_index_path, resource_type_from_index_path, section, share_root,
    GroupShareManager, MasterIndexStore, MissingGroupEntry, ResourceMetadata, Timestamp,
};
use crate::keys::KeyManager;
use crate::remote::{BlobStore, Session};
use crate::worker::{CommandSink, WorkerRequest};

/// Bilan d'une réconciliation de portée.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entrées récupérées et écrites dans le cache.
    pub synced: usize,
    /// Le cache contenait déjà des entrées pour cette portée.
    pub had_previous_entries: bool,
    /// Chemins référencés par l'index mais inutilisables.
    pub missing: Vec<String>,
    /// Entrées de cache supprimées faute de référence distante.
    pub pruned: usize,
}

/// Bilan d'un chargement complet : portée propre puis chaque partage.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub own: ReconcileReport,
    pub shares: Vec<(String, ReconcileReport)>,
}

enum CacheOutcome {
    Cached,
    /// Ancien format de métadonnées, ignoré.
    Legacy,
    /// Chemin sans identifiant de ressource.
    Unaddressable,
}

/// Position de reprise dans les entrées d'un groupe, résolues une seule fois.
#[derive(Debug, Clone)]
pub struct GroupCursor {
    resolved: Vec<CacheEntry>,
    offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GroupPage {
    pub entries: Vec<CacheEntry>,
    pub next: Option<GroupCursor>,
}

/// Vrai si l'entrée doit être (re)récupérée.
///
/// Un horodatage distant inconnu ne force pas de nouvelle récupération d'une entrée déjà
/// en cache : la réconciliation reste idempotente sur un index fraîchement créé.
/// En particulier, horodatages en cache et distant tous deux inconnus : pas de nouvelle récupération.
fn needs_fetch(cached: Option<Option<Timestamp>>, remote: Option<Timestamp>) -> bool {
    match (cached, remote) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(None), Some(_)) => true,
        (Some(Some(cached)), Some(remote)) => remote > cached,
    }
}

pub struct SyncEngine<'a, S: BlobStore> {
    session: &'a Session<S>,
    cache: &'a CacheStore,
    file_types: &'a [String],
}

impl<'a, S: BlobStore> SyncEngine<'a, S> {
    pub fn new(session: &'a Session<S>, cache: &'a CacheStore, file_types: &'a [String]) -> Self {
        Self {
            session,
            cache,
            file_types,
        }
    }

    fn owner_key(&self) -> &'a str {
        self.session.public_key()
    }

    /// S'assure que l'index du principal existe, réconcilie sa portée puis celle de chaque partage.
    pub async fn load(&self) -> Result<LoadReport> {
        MasterIndexStore::new(self.session, self.file_types)
            .ensure_own()
            .await?;
        let own = self.reconcile(None).await?;

        let mut shares = Vec::new();
        for user in GroupShareManager::new(self.session).load_shares().await.into_values() {
            match self.reconcile(Some(&user)).await {
                Ok(report) => shares.push((user, report)),
                Err(e) => log::error!("SyncEngine::load: share {} not reconciled: {}", user, e),
            }
        }
        Ok(LoadReport { own, shares })
    }

    /// Réconcilie le cache avec l'index maître d'une portée.
    ///
    /// Une ressource inutilisable est notée manquante sans interrompre le lot ; seules les
    /// erreurs du cache local sont fatales.
    pub async fn reconcile(&self, acting_user: Option<&str>) -> Result<ReconcileReport> {
        let owner = self.owner_key();
        let root = acting_user.map(|_| share_root(owner)).unwrap_or_default();
        let masters = MasterIndexStore::new(self.session, self.file_types);
        let Some(mut index) = masters.load(&root, acting_user).await else {
            log::info!(
                "SyncEngine::reconcile: no master index for scope {:?}",
                acting_user
            );
            return Ok(ReconcileReport::default());
        };

        let filter = ShareFilter::from_user(acting_user);
        let mut existing_cache: HashMap<String, Option<Timestamp>> = HashMap::new();
        for resource_type in self.file_types {
            existing_cache.extend(
                self.cache
                    .stamps_in_section(&section(owner, resource_type), filter)?,
            );
        }

        let mut report = ReconcileReport {
            had_previous_entries: !existing_cache.is_empty(),
            ..ReconcileReport::default()
        };
        let mut referenced = HashSet::new();

        for (path, remote_updated) in index.iter() {
            let id = index_id(owner, path, acting_user);
            let cached = existing_cache.get(&id).copied();
            referenced.insert(id.clone());
            if !needs_fetch(cached, remote_updated) {
                continue;
            }

            match self.cache_resource(path, id, acting_user).await {
                Ok(CacheOutcome::Cached) => report.synced += 1,
                Ok(CacheOutcome::Legacy) => {
                    log::debug!("SyncEngine::reconcile: skipping legacy metadata {}", path)
                }
                Ok(CacheOutcome::Unaddressable) => {}
                Err(SyncError::Cache(e)) => return Err(e.into()),
                Err(e) if e.is_unavailable() => {
                    log::warn!("SyncEngine::reconcile: {} unavailable: {}", path, e);
                    report.missing.push(path.to_string());
                }
                Err(e) => log::warn!("SyncEngine::reconcile: {} skipped until next pass: {}", path, e),
            }
        }

        if acting_user.is_none() && !report.missing.is_empty() {
            for path in &report.missing {
                index.remove(path);
            }
            masters.save("", &index).await;
        }

        for id in existing_cache.keys().filter(|id| !referenced.contains(*id)) {
            if self.cache.delete(id)? {
                report.pruned += 1;
            }
        }

        log::info!(
            "SyncEngine::reconcile: scope {:?}: synced={}, missing={}, pruned={}",
            acting_user,
            report.synced,
            report.missing.len(),
            report.pruned
        );
        Ok(report)
    }

    /// Récupère, déchiffre et met en cache les métadonnées d'une ressource.
    async fn cache_resource(
        &self,
        path: &str,
        id: String,
        acting_user: Option<&str>,
    ) -> Result<CacheOutcome> {
        let Some(resource_id) = resource_id_from_index_path(path) else {
            return Ok(CacheOutcome::Unaddressable);
        };
        let resource_type = resource_type_from_index_path(path);
        let json = KeyManager::new(self.session)
            .fetch_resource(path, &resource_id, resource_type, acting_user)
            .await?;
        let metadata: ResourceMetadata = serde_json::from_slice(&json)?;
        if metadata.is_legacy() {
            return Ok(CacheOutcome::Legacy);
        }

        let entry = CacheEntry::seal(
            self.session.identity().cache_key(),
            id,
            section(self.owner_key(), &metadata.resource_type),
            &json,
            metadata.last_updated_utc,
            acting_user.map(str::to_string),
        )?;
        self.cache.put(&entry)?;
        Ok(CacheOutcome::Cached)
    }

    /// Met à jour l'entrée de cache d'une ressource du principal.
    ///
    /// Renvoie `false` si la ressource n'a pas pu être mise en cache (ancien format, chemin invalide).
    pub async fn update_cached_index(&self, index_file: &str) -> Result<bool> {
        let id = index_id(self.owner_key(), index_file, None);
        match self.cache_resource(index_file, id, None).await? {
            CacheOutcome::Cached => Ok(true),
            CacheOutcome::Legacy | CacheOutcome::Unaddressable => Ok(false),
        }
    }

    pub fn remove_cached_index(&self, index_file: &str) -> Result<bool> {
        let id = index_id(self.owner_key(), index_file, None);
        Ok(self.cache.delete(&id)?)
    }

    /// Met en cache une liste de ressources du principal ; renvoie le nombre mis en cache.
    pub async fn add_indexes_to_cache(&self, index_files: &[String]) -> Result<usize> {
        let mut cached = 0;
        for index_file in index_files {
            match self.update_cached_index(index_file).await {
                Ok(true) => cached += 1,
                Ok(false) => {}
                Err(SyncError::Cache(e)) => return Err(e.into()),
                Err(e) => log::warn!("SyncEngine::add_indexes_to_cache: {}: {}", index_file, e),
            }
        }
        Ok(cached)
    }

    /// Entrées en cache d'un type, des plus récentes aux plus anciennes.
    ///
    /// `share_names = None` : vue propre ; sinon uniquement les partages nommés.
    pub fn entries(
        &self,
        resource_type: &str,
        share_names: Option<&[String]>,
        max: Option<usize>,
        cursor: Option<&CacheCursor>,
    ) -> Result<CachePage> {
        Ok(self.cache.entries(
            &section(self.owner_key(), resource_type),
            ShareFilter::from_names(share_names),
            max,
            cursor,
        )?)
    }

    /// Entrées en cache d'un groupe, des plus anciennes aux plus récentes.
    ///
    /// Au premier appel l'index du groupe est résolu contre le cache ; les entrées
    /// introuvables sont soumises à `sink` pour validation. Les pages suivantes
    /// réutilisent la résolution portée par le curseur.
    pub async fn group_entries(
        &self,
        resource_type: &str,
        group_id: &str,
        max: Option<usize>,
        cursor: Option<GroupCursor>,
        sink: Option<&dyn CommandSink>,
    ) -> Result<GroupPage> {
        let (resolved, offset) = match cursor {
            Some(cursor) => (cursor.resolved, cursor.offset),
            None => (self.resolve_group(resource_type, group_id, sink).await?, 0),
        };

        let start = offset.min(resolved.len());
        let end = match max {
            Some(max) => start.saturating_add(max).min(resolved.len()),
            None => resolved.len(),
        };
        let entries = resolved[start..end].to_vec();
        let next = (end < resolved.len()).then_some(GroupCursor {
            resolved,
            offset: end,
        });
        Ok(GroupPage { entries, next })
    }

    async fn resolve_group(
        &self,
        resource_type: &str,
        group_id: &str,
        sink: Option<&dyn CommandSink>,
    ) -> Result<Vec<CacheEntry>> {
        let group_index = GroupShareManager::new(self.session)
            .load_group_index(group_id)
            .await;
        let identity = self.session.identity();

        let mut resolved = Vec::new();
        let mut missing = Vec::new();
        for (index_file, owner) in &group_index {
            if resource_type_from_index_path(index_file) != resource_type {
                continue;
            }
            let owner = owner.as_deref().filter(|name| !identity.is_self(name));
            let id = index_id(self.owner_key(), index_file, owner);
            match self.cache.get(&id)? {
                Some(entry) => resolved.push(entry),
                None => missing.push(MissingGroupEntry {
                    index_file: index_file.clone(),
                    user_name: owner.map(str::to_string),
                }),
            }
        }

        if !missing.is_empty() {
            log::debug!(
                "SyncEngine::group_entries: {} unresolved entries in group {}",
                missing.len(),
                group_id
            );
            if let Some(sink) = sink {
                sink.submit(WorkerRequest::ValidateGroupEntries {
                    group_id: group_id.to_string(),
                    missing,
                });
            }
        }

        resolved.sort_by_key(|entry| entry.last_updated);
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileOperation, MasterIndex, MASTER_INDEX};
    use crate::remote::PutOptions;
    use crate::testing::{cache_store, file_types, publish_resource, TestHub};
    use crate::worker::CommandQueue;

    async fn write_master(session: &Session<crate::testing::CountingStore>, entries: &[(&str, Option<i64>)]) {
        let index: MasterIndex = entries.iter().map(|(p, t)| (*p, *t)).collect();
        session
            .put_file(MASTER_INDEX, &index.to_json(), PutOptions::private())
            .await
            .unwrap();
    }

    #[test]
    fn fetch_rule() {
        assert!(needs_fetch(None, None));
        assert!(needs_fetch(None, Some(1)));
        assert!(needs_fetch(Some(None), Some(1)));
        assert!(needs_fetch(Some(Some(100)), Some(150)));
        assert!(!needs_fetch(Some(Some(100)), Some(100)));
        assert!(!needs_fetch(Some(Some(100)), Some(50)));
        assert!(!needs_fetch(Some(Some(100)), None));
        assert!(!needs_fetch(Some(None), None));
    }

    #[tokio::test]
    async fn end_to_end_incremental_scenario() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        publish_resource(&alice, "videos", "r1", Some(100)).await;
        publish_resource(&alice, "videos", "r2", Some(200)).await;
        write_master(&alice, &[("videos/r1.index", Some(100)), ("videos/r2.index", Some(200))]).await;

        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(!report.had_previous_entries);
        let page = engine.entries("videos", None, None, None).unwrap();
        let stamps: Vec<_> = page.entries.iter().map(|e| e.last_updated).collect();
        assert_eq!(stamps, vec![Some(200), Some(100)]);

        // r1 modifiée : seule r1 est récupérée à nouveau.
        publish_resource(&alice, "videos", "r1", Some(150)).await;
        write_master(&alice, &[("videos/r1.index", Some(150)), ("videos/r2.index", Some(200))]).await;
        hub.reset_counts();
        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.had_previous_entries);
        assert_eq!(hub.gets_of("alice.id/videos/r1.index"), 1);
        assert_eq!(hub.gets_of("alice.id/videos/r2.index"), 0);

        // r2 retirée de l'index : son entrée disparaît.
        write_master(&alice, &[("videos/r1.index", Some(150))]).await;
        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 0);
        assert_eq!(report.pruned, 1);
        let page = engine.entries("videos", None, None, None).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].last_updated, Some(150));
        let r2_id = index_id(alice.public_key(), "videos/r2.index", None);
        assert!(cache.get(&r2_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        publish_resource(&alice, "videos", "r1", Some(100)).await;
        publish_resource(&alice, "images", "r2", Some(200)).await;
        // Index fraîchement créé : horodatages inconnus.
        let first = engine.load().await.unwrap();
        assert_eq!(first.own.synced, 2);

        let snapshot = |engine: &SyncEngine<'_, _>| {
            let mut all = engine.entries("videos", None, None, None).unwrap().entries;
            all.extend(engine.entries("images", None, None, None).unwrap().entries);
            all
        };
        let before = snapshot(&engine);

        hub.reset_counts();
        let second = engine.reconcile(None).await.unwrap();
        assert_eq!(second.synced, 0);
        assert_eq!(second.pruned, 0);
        assert!(second.missing.is_empty());
        assert_eq!(hub.puts(), 0);
        assert_eq!(hub.deletes(), 0);
        // Données scellées identiques octet pour octet : aucune réécriture.
        assert_eq!(snapshot(&engine), before);
    }

    #[tokio::test]
    async fn partial_failure_is_isolated_and_pruned_from_master() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        publish_resource(&alice, "videos", "a", Some(1)).await;
        publish_resource(&alice, "videos", "b", Some(2)).await;
        publish_resource(&alice, "videos", "c", Some(3)).await;
        alice
            .store()
            .put("alice.id", "videos/b.index", b"not an envelope")
            .await
            .unwrap();
        write_master(
            &alice,
            &[
                ("videos/a.index", Some(1)),
                ("videos/b.index", Some(2)),
                ("videos/c.index", Some(3)),
            ],
        )
        .await;

        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.missing, vec!["videos/b.index".to_string()]);

        let page = engine.entries("videos", None, None, None).unwrap();
        assert_eq!(page.entries.len(), 2);

        let master = MasterIndexStore::new(&alice, &types)
            .load("", None)
            .await
            .unwrap();
        assert!(!master.contains("videos/b.index"));
        assert!(master.contains("videos/a.index"));
        assert!(master.contains("videos/c.index"));
    }

    #[tokio::test]
    async fn transient_remote_error_keeps_entry_in_master() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        publish_resource(&alice, "videos", "a", Some(1)).await;
        publish_resource(&alice, "videos", "b", Some(2)).await;
        write_master(&alice, &[("videos/a.index", Some(1)), ("videos/b.index", Some(2))]).await;

        hub.fail_reads_of("alice.id/videos/b.index");
        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.missing.is_empty());
        let master = MasterIndexStore::new(&alice, &types)
            .load("", None)
            .await
            .unwrap();
        assert!(master.contains("videos/b.index"));

        hub.heal();
        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(engine.entries("videos", None, None, None).unwrap().entries.len(), 2);
    }

    #[tokio::test]
    async fn legacy_metadata_is_skipped() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        let keys = KeyManager::new(&alice);
        keys.create_private_key("old", "videos").await.unwrap();
        alice
            .put_file(
                "videos/old.index",
                br#"{"id":"old","type":"videos","lastUpdatedUTC":5,"mediaType":2}"#,
                PutOptions::private(),
            )
            .await
            .unwrap();
        write_master(&alice, &[("videos/old.index", Some(5))]).await;

        let report = engine.reconcile(None).await.unwrap();
        assert_eq!(report.synced, 0);
        assert!(report.missing.is_empty());
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn shared_entries_are_scoped_to_their_share() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let bob = hub.session("bob.id", 2);
        alice.publish_profile().await.unwrap();
        bob.publish_profile().await.unwrap();
        let types = file_types();

        // Alice partage r1 avec Bob.
        let r1 = publish_resource(&alice, "videos", "r1", Some(100)).await;
        MasterIndexStore::new(&alice, &types)
            .update(FileOperation::Share, &[r1.into()], Some("bob.id"), None)
            .await
            .unwrap();

        // Bob possède r2 et connaît Alice.
        publish_resource(&bob, "videos", "r2", Some(200)).await;
        GroupShareManager::new(&bob)
            .update_shares(&["alice.id".to_string()], false)
            .await
            .unwrap();

        let cache = cache_store(&hub, &bob);
        let engine = SyncEngine::new(&bob, &cache, &types);
        let report = engine.load().await.unwrap();
        assert_eq!(report.own.synced, 1);
        assert_eq!(report.shares.len(), 1);
        assert_eq!(report.shares[0].1.synced, 1);

        let own = engine.entries("videos", None, None, None).unwrap();
        assert_eq!(own.entries.len(), 1);
        assert_eq!(own.entries[0].share_name, None);

        let alice_view = vec!["ALICE.id".to_string()];
        let shared = engine
            .entries("videos", Some(&alice_view), None, None)
            .unwrap();
        assert_eq!(shared.entries.len(), 1);
        assert_eq!(shared.entries[0].share_name.as_deref(), Some("alice.id"));
        let metadata: ResourceMetadata =
            serde_json::from_slice(&shared.entries[0].open(bob.identity().cache_key()).unwrap())
                .unwrap();
        assert_eq!(metadata.id, "r1");

        let other = vec!["carol.id".to_string()];
        assert!(engine
            .entries("videos", Some(&other), None, None)
            .unwrap()
            .entries
            .is_empty());

        // Une réconciliation de la vue propre ne touche pas aux entrées partagées.
        let again = engine.reconcile(None).await.unwrap();
        assert_eq!(again.pruned, 0);
        assert_eq!(
            engine
                .entries("videos", Some(&alice_view), None, None)
                .unwrap()
                .entries
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn targeted_cache_commands() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);

        publish_resource(&alice, "videos", "r1", Some(10)).await;
        publish_resource(&alice, "videos", "r2", Some(20)).await;
        let added = engine
            .add_indexes_to_cache(&[
                "videos/r1.index".to_string(),
                "videos/r2.index".to_string(),
                "videos/missing.index".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(added, 2);

        publish_resource(&alice, "videos", "r1", Some(30)).await;
        assert!(engine.update_cached_index("videos/r1.index").await.unwrap());
        let page = engine.entries("videos", None, Some(1), None).unwrap();
        assert_eq!(page.entries[0].last_updated, Some(30));
        assert!(page.next.is_some());

        assert!(engine.remove_cached_index("videos/r1.index").unwrap());
        assert!(!engine.remove_cached_index("videos/r1.index").unwrap());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn group_entries_resolve_paginate_and_report_missing() {
        let hub = TestHub::new();
        let alice = hub.session("alice.id", 1);
        let types = file_types();
        let cache = cache_store(&hub, &alice);
        let engine = SyncEngine::new(&alice, &cache, &types);
        let groups = GroupShareManager::new(&alice);

        let mut members = Vec::new();
        for (id, ts) in [("r1", 30), ("r2", 10), ("r3", 20)] {
            members.push(publish_resource(&alice, "videos", id, Some(ts)).await);
        }
        let image = publish_resource(&alice, "images", "i1", Some(5)).await;
        engine.load().await.unwrap();

        let mut unsynced = ResourceMetadata::new("videos", "r4", Some(40));
        unsynced.user_name = Some("bob.id".to_string());
        members.push(unsynced);
        members.push(image);
        groups
            .add_members(&members, &["g1".to_string()])
            .await
            .unwrap();

        let queue = CommandQueue::default();
        let first = engine
            .group_entries("videos", "g1", Some(2), None, Some(&queue))
            .await
            .unwrap();
        let stamps: Vec<_> = first.entries.iter().map(|e| e.last_updated).collect();
        assert_eq!(stamps, vec![Some(10), Some(20)]);

        let second = engine
            .group_entries("videos", "g1", Some(2), first.next, Some(&queue))
            .await
            .unwrap();
        let stamps: Vec<_> = second.entries.iter().map(|e| e.last_updated).collect();
        assert_eq!(stamps, vec![Some(30)]);
        assert!(second.next.is_none());

        // Une seule résolution, donc une seule demande de validation.
        assert_eq!(
            queue.drain(),
            vec![WorkerRequest::ValidateGroupEntries {
                group_id: "g1".to_string(),
                missing: vec![MissingGroupEntry {
                    index_file: "videos/r4.index".to_string(),
                    user_name: Some("bob.id".to_string()),
                }],
            }]
        );
    }
}
