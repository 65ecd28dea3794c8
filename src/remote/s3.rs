use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use serde::{Deserialize, Serialize};

use super::{validate_path, BlobStore, RemoteError};

/// Configuration d'un hub compatible S3 (Storj DCS, MinIO, AWS).
///
/// Si les identifiants sont vides, la chaîne de credentials standard AWS
/// (variables d'environnement, profil) est utilisée.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    pub endpoint: String,
    pub bucket_name: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    // Storj utilise généralement us-east-1
    "us-east-1".to_string()
}

impl S3StoreConfig {
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        endpoint: String,
        bucket_name: String,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            endpoint,
            bucket_name,
            region: default_region(),
        }
    }

    fn has_static_credentials(&self) -> bool {
        !self.access_key_id.is_empty() && !self.secret_access_key.is_empty()
    }
}

/// Hub sur un bucket S3 : chaque utilisateur occupe le préfixe `<user>/`.
pub struct S3Store {
    s3_client: S3Client,
    bucket_name: String,
}

impl S3Store {
    pub async fn new(config: S3StoreConfig) -> Result<Self, RemoteError> {
        if config.bucket_name.is_empty() || config.endpoint.is_empty() {
            return Err(RemoteError::Backend(
                "S3 endpoint and bucket name are required".to_string(),
            ));
        }

        let s3_config = if config.has_static_credentials() {
            let credentials = Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "aether-sync",
            );
            aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(credentials)
                .region(Region::new(config.region.clone()))
                .endpoint_url(&config.endpoint)
                .force_path_style(true)
                .build()
        } else {
            let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&sdk_config)
                .endpoint_url(&config.endpoint)
                .force_path_style(true)
                .build()
        };

        log::info!(
            "S3Store::new: endpoint={}, bucket={}",
            config.endpoint,
            config.bucket_name
        );
        Ok(Self {
            s3_client: S3Client::from_conf(s3_config),
            bucket_name: config.bucket_name,
        })
    }

    fn object_key(bucket: &str, path: &str) -> Result<String, RemoteError> {
        validate_path(bucket)?;
        validate_path(path)?;
        Ok(format!("{bucket}/{path}"))
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let object_key = Self::object_key(bucket, path)?;
        let result = match self
            .s3_client
            .get_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .send()
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let error_msg = e.to_string();
                let code = e.code().unwrap_or_default().to_string();
                if code == "NoSuchKey" || error_msg.contains("NoSuchKey") || error_msg.contains("404")
                {
                    return Ok(None);
                }
                return Err(RemoteError::Backend(format!(
                    "Failed to download {}: {} (code: {})",
                    object_key, error_msg, code
                )));
            }
        };

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| RemoteError::Io(format!("Failed to read response body: {}", e)))?
            .into_bytes()
            .to_vec();
        Ok(Some(data))
    }

    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), RemoteError> {
        let object_key = Self::object_key(bucket, path)?;
        log::debug!(
            "S3Store::put: bucket={}, key={}, data_len={}",
            self.bucket_name,
            object_key,
            data.len()
        );
        self.s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| {
                let error_msg = e.to_string();
                log::error!(
                    "S3Store::put failed: key={}, code={:?}, message={:?}",
                    object_key,
                    e.code(),
                    e.message()
                );
                RemoteError::Backend(format!("Failed to upload {}: {}", object_key, error_msg))
            })?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<(), RemoteError> {
        let object_key = Self::object_key(bucket, path)?;
        // S3 renvoie un succès pour une clé absente.
        self.s3_client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| RemoteError::Backend(format!("Failed to delete {}: {}", object_key, e)))?;
        Ok(())
    }

    async fn list(&self, bucket: &str) -> Result<Vec<String>, RemoteError> {
        validate_path(bucket)?;
        let prefix = format!("{bucket}/");
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let result = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| RemoteError::Backend(format!("Failed to list files: {}", e)))?;

            // Ignore les préfixes/dossiers (clés terminées par "/").
            keys.extend(result.contents().iter().filter_map(|obj| {
                obj.key()
                    .filter(|k| !k.ends_with('/'))
                    .and_then(|k| k.strip_prefix(&prefix))
                    .map(str::to_string)
            }));

            match result.next_continuation_token() {
                Some(token) if result.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Les tests réseau nécessitent des credentials valides ; on teste la configuration.
    #[test]
    fn s3_config_defaults() {
        let config = S3StoreConfig::new(
            "test-access-key".to_string(),
            "test-secret-key".to_string(),
            "https://gateway.storjshare.io".to_string(),
            "test-bucket".to_string(),
        );

        assert_eq!(config.region, "us-east-1");
        assert!(config.has_static_credentials());

        let parsed: S3StoreConfig = serde_json::from_str(
            r#"{"endpoint":"http://localhost:9000","bucket_name":"hub"}"#,
        )
        .unwrap();
        assert_eq!(parsed.region, "us-east-1");
        assert!(!parsed.has_static_credentials());
    }

    #[test]
    fn object_keys_are_prefixed_by_user() {
        assert_eq!(
            S3Store::object_key("alice.id", "videos/r1.index").unwrap(),
            "alice.id/videos/r1.index"
        );
        assert!(S3Store::object_key("alice.id", "../x").is_err());
    }
}
