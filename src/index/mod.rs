//! Modèle de données distant : index maître, index de groupe, métadonnées de ressource.
//!
//! Les index sont des documents JSON lâchement typés côté distant ; on les convertit ici
//! en types explicites et on tolère le contenu malformé (traité comme absent).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod addressing;
pub mod groups;
pub mod master;

pub use addressing::{
    group_index_path, index_file_path, index_id, private_key_path, resource_id_from_index_path,
    resource_type_from_index_path, section, share_root,
};
pub use groups::GroupShareManager;
pub use master::{FileOperation, MasterIndexStore, ShareUserEntry};

pub const MASTER_INDEX: &str = "master-index";
pub const INTERNAL_INDEX: &str = "internal-index";
pub const SHARE_INDEX: &str = "share-index";
pub const GROUP_INDEX: &str = "group-index";
pub const SELECTED_SHARES: &str = "selected-shares";
pub const SELECTED_GROUP: &str = "selected-group";
pub const INDEX_SUFFIX: &str = ".index";
pub const DEFAULT_FILE_TYPES: [&str; 2] = ["videos", "images"];

/// Horodatage UTC en millisecondes.
pub type Timestamp = i64;

/// Index maître : chemin d'index -> dernière mise à jour (`None` = inconnue, à récupérer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MasterIndex {
    entries: BTreeMap<String, Option<Timestamp>>,
}

impl MasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Désérialisation tolérante : `None` si le document n'est pas un objet JSON.
    ///
    /// Une valeur non numérique est lue comme un horodatage inconnu.
    pub fn from_json(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let object = value.as_object()?;
        let entries = object
            .iter()
            .map(|(path, stamp)| (path.clone(), timestamp_from_value(stamp)))
            .collect();
        Some(Self { entries })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.entries).unwrap_or_else(|_| b"{}".to_vec())
    }

    pub fn get(&self, path: &str) -> Option<Option<Timestamp>> {
        self.entries.get(path).copied()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, last_updated: Option<Timestamp>) {
        self.entries.insert(path.into(), last_updated);
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<Timestamp>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Option<Timestamp>)> for MasterIndex {
    fn from_iter<I: IntoIterator<Item = (S, Option<Timestamp>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

fn timestamp_from_value(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as Timestamp)),
        _ => None,
    }
}

/// Index d'un groupe : chemin d'index -> utilisateur propriétaire (`None` = le principal).
pub type GroupIndex = BTreeMap<String, Option<String>>;

/// Index des partages : nom en minuscules -> nom d'utilisateur.
pub type ShareIndex = BTreeMap<String, String>;

/// Groupe tel que stocké dans `group-index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Document de métadonnées d'une ressource (`<type>/<id>.index`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(rename = "lastUpdatedUTC", default)]
    pub last_updated_utc: Option<Timestamp>,
    /// Présent uniquement dans l'ancien format (incompatible).
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<Value>,
    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceMetadata {
    pub fn new(resource_type: &str, id: &str, last_updated_utc: Option<Timestamp>) -> Self {
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            last_updated_utc,
            media_type: None,
            user_name: None,
            extra: Map::new(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.media_type.is_some()
    }

    pub fn index_file(&self) -> String {
        index_file_path(&self.resource_type, &self.id)
    }
}

/// Entrée passée aux opérations de mise à jour de l'index maître.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub index_file: String,
    pub metadata: ResourceMetadata,
}

impl From<ResourceMetadata> for FileEntry {
    fn from(metadata: ResourceMetadata) -> Self {
        Self {
            index_file: metadata.index_file(),
            metadata,
        }
    }
}

/// Entrée de groupe introuvable dans le cache, à valider contre le distant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingGroupEntry {
    pub index_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_index_tolerates_nulls_and_floats() {
        let index = MasterIndex::from_json(
            br#"{"videos/r1.index": 100, "videos/r2.index": null, "images/r3.index": 1.7e3, "x": "bad"}"#,
        )
        .unwrap();
        assert_eq!(index.get("videos/r1.index"), Some(Some(100)));
        assert_eq!(index.get("videos/r2.index"), Some(None));
        assert_eq!(index.get("images/r3.index"), Some(Some(1700)));
        assert_eq!(index.get("x"), Some(None));
        assert_eq!(index.get("missing"), None);
    }

    #[test]
    fn master_index_malformed_is_absent() {
        assert!(MasterIndex::from_json(b"not json").is_none());
        assert!(MasterIndex::from_json(b"[1,2]").is_none());
        assert!(MasterIndex::from_json(b"{}").unwrap().is_empty());
    }

    #[test]
    fn master_index_serializes_as_plain_map() {
        let index: MasterIndex = [("videos/r1.index", Some(5)), ("videos/r2.index", None)]
            .into_iter()
            .collect();
        let json: Value = serde_json::from_slice(&index.to_json()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"videos/r1.index": 5, "videos/r2.index": null})
        );
    }

    #[test]
    fn metadata_legacy_marker_and_extra_fields() {
        let current: ResourceMetadata = serde_json::from_str(
            r#"{"id":"r1","type":"videos","lastUpdatedUTC":100,"title":"Trip"}"#,
        )
        .unwrap();
        assert!(!current.is_legacy());
        assert_eq!(current.extra.get("title"), Some(&Value::from("Trip")));
        assert_eq!(current.index_file(), "videos/r1.index");

        let legacy: ResourceMetadata = serde_json::from_str(
            r#"{"id":"r2","type":"videos","lastUpdatedUTC":100,"mediaType":1}"#,
        )
        .unwrap();
        assert!(legacy.is_legacy());

        let null_marker: ResourceMetadata = serde_json::from_str(
            r#"{"id":"r3","type":"videos","mediaType":null}"#,
        )
        .unwrap();
        assert!(!null_marker.is_legacy());
        assert_eq!(null_marker.last_updated_utc, None);
    }
}
