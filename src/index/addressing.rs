use sha2::{Digest, Sha256};

use super::INDEX_SUFFIX;

const ADDRESS_LEN: usize = 40;

/// Identifiant déterministe d'une entrée de cache.
///
/// Hash SHA-256 de `<clé publique>_<chemin d'index>[_<utilisateur>]`. La même ressource
/// vue à travers un partage produit donc un identifiant distinct.
pub fn index_id(owner_public_key: &str, index_file: &str, acting_user: Option<&str>) -> String {
    let mut value = format!("{owner_public_key}_{index_file}");
    if let Some(user) = acting_user.filter(|u| !u.is_empty()) {
        value.push('_');
        value.push_str(user);
    }
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// `videos/abc.index` -> `abc` ; `None` sans séparateur.
pub fn resource_id_from_index_path(path: &str) -> Option<String> {
    let i = path.rfind('/')?;
    Some(path[i + 1..].replacen(INDEX_SUFFIX, "", 1))
}

/// `videos/abc.index` -> `videos` ; chaîne vide sans séparateur.
pub fn resource_type_from_index_path(path: &str) -> &str {
    path.find('/').map(|i| &path[..i]).unwrap_or("")
}

/// Adresse courte dérivée d'une clé publique.
fn address(public_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(public_key.as_bytes()));
    digest[..ADDRESS_LEN].to_string()
}

/// Préfixe sous lequel un propriétaire dépose ce qu'il partage avec `public_key`.
pub fn share_root(public_key: &str) -> String {
    format!("share/{}/", address(public_key))
}

pub fn private_key_path(root: &str, id: &str, resource_type: &str) -> String {
    format!("{root}{resource_type}/{id}/private.key")
}

pub fn index_file_path(resource_type: &str, id: &str) -> String {
    format!("{resource_type}/{id}{INDEX_SUFFIX}")
}

pub fn group_index_path(group_id: &str) -> String {
    format!("groups/{group_id}{INDEX_SUFFIX}")
}

/// Section du cache : `<clé publique>_<type>`.
pub fn section(public_key: &str, resource_type: &str) -> String {
    format!("{public_key}_{resource_type}")
}

/// Chemin d'index d'un type reconnu (`<type>/<nom>.index`).
pub fn is_recognized_index(path: &str, file_types: &[String]) -> bool {
    path.ends_with(INDEX_SUFFIX)
        && file_types
            .iter()
            .any(|t| path.strip_prefix(t.as_str()).is_some_and(|rest| rest.starts_with('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_id_is_deterministic_and_input_sensitive() {
        let a = index_id("pk1", "videos/r1.index", None);
        assert_eq!(a, index_id("pk1", "videos/r1.index", None));
        assert_ne!(a, index_id("pk2", "videos/r1.index", None));
        assert_ne!(a, index_id("pk1", "videos/r2.index", None));
        assert_ne!(a, index_id("pk1", "videos/r1.index", Some("alice.id")));
        assert_ne!(
            index_id("pk1", "videos/r1.index", Some("alice.id")),
            index_id("pk1", "videos/r1.index", Some("bob.id"))
        );
        // Un nom vide équivaut à l'absence de nom.
        assert_eq!(a, index_id("pk1", "videos/r1.index", Some("")));
    }

    #[test]
    fn path_parsing() {
        assert_eq!(
            resource_id_from_index_path("videos/abc.index").as_deref(),
            Some("abc")
        );
        assert_eq!(
            resource_id_from_index_path("share/x/videos/abc.index").as_deref(),
            Some("abc")
        );
        assert_eq!(resource_id_from_index_path("abc.index"), None);
        assert_eq!(resource_type_from_index_path("videos/abc.index"), "videos");
        assert_eq!(resource_type_from_index_path("abc.index"), "");
    }

    #[test]
    fn derived_paths() {
        let root = share_root("pk1");
        assert!(root.starts_with("share/") && root.ends_with('/'));
        assert_eq!(root.len(), "share/".len() + ADDRESS_LEN + 1);
        assert_eq!(root, share_root("pk1"));
        assert_ne!(root, share_root("pk2"));

        assert_eq!(private_key_path("", "r1", "videos"), "videos/r1/private.key");
        assert_eq!(
            private_key_path(&root, "r1", "videos"),
            format!("{root}videos/r1/private.key")
        );
        assert_eq!(group_index_path("g1"), "groups/g1.index");
        assert_eq!(section("pk1", "images"), "pk1_images");
    }

    #[test]
    fn recognized_index_paths() {
        let types = vec!["videos".to_string(), "images".to_string()];
        assert!(is_recognized_index("videos/r1.index", &types));
        assert!(is_recognized_index("images/r2.index", &types));
        assert!(!is_recognized_index("videos/r1/private.key", &types));
        assert!(!is_recognized_index("videosx/r1.index", &types));
        assert!(!is_recognized_index("groups/g1.index", &types));
    }
}
