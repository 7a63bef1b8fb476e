use super::{StorageError, StorageResult};
use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectCannedAcl, ObjectIdentifier,
    StorageClass,
};
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

/// Maximum keys accepted by a single DeleteObjects request.
const DELETE_BATCH: usize = 1000;

/// S3-compatible object store standing in for a web server directory tree.
///
/// Objects are keyed by their path with the leading `/` removed; "directories"
/// exist only as key prefixes.
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Storage {
    /// Create a new client for the configured bucket
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Remote(
                "storage.s3.bucket must be set for the remote object store".to_string(),
            ));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for non-AWS providers
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store web storage initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    pub async fn listdir(&self, path: &str) -> StorageResult<Vec<String>> {
        let prefix = normalize_dir_prefix(path)?;
        let mut names = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| remote("list objects", e))?;

            for common in response.common_prefixes() {
                if let Some(p) = common.prefix() {
                    names.push(entry_name(p, &prefix));
                }
            }
            for object in response.contents() {
                if let Some(key) = object.key() {
                    if key != prefix {
                        names.push(entry_name(key, &prefix));
                    }
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(names)
    }

    /// Object stores have no directories; nothing to create.
    pub async fn mkdir(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    /// Upload a local file, make it publicly readable and delete the source
    #[instrument(skip(self), fields(src = %src.display()))]
    pub async fn move_to_web(&self, src: &Path, dest: &str) -> StorageResult<()> {
        let is_file = tokio::fs::metadata(src)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(StorageError::Io(format!(
                "Source path must be a regular file: {}",
                src.display()
            )));
        }

        let key = object_key(dest);
        if key.is_empty() || key.ends_with('/') {
            return Err(StorageError::Io(format!(
                "Destination path must not be a directory: {}",
                dest
            )));
        }

        let data = tokio::fs::read(src)
            .await
            .map_err(|e| StorageError::io(format!("read {}", src.display()), e))?;
        let size = data.len();
        let content_type = get_content_type(&key);

        if size > self.config.multipart_threshold_bytes {
            self.multipart_upload(data, &key, content_type).await?;
        } else {
            self.simple_upload(data, &key, content_type).await?;
        }

        let stored = self.stored_size(&key).await?;
        if stored != Some(size as i64) {
            if let Err(e) = self.remove_file(dest).await {
                warn!(key = %key, error = %e, "Failed to delete short upload");
            }
            return Err(StorageError::Io(format!(
                "move_to_web(): {} to {} attempted {} bytes but only transferred {}",
                src.display(),
                dest,
                size,
                stored.unwrap_or(0)
            )));
        }

        tokio::fs::remove_file(src)
            .await
            .map_err(|e| StorageError::io(format!("remove {}", src.display()), e))?;

        debug!(key = %key, size_bytes = size, "Uploaded file to object store");
        Ok(())
    }

    /// Single-part upload for small files
    async fn simple_upload(&self, data: Vec<u8>, key: &str, content_type: &str) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead);

        if self.config.reduced_redundancy {
            request = request.storage_class(StorageClass::ReducedRedundancy);
        }

        request.send().await.map_err(|e| remote("put object", e))?;
        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, data: Vec<u8>, key: &str, content_type: &str) -> StorageResult<()> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead);

        if self.config.reduced_redundancy {
            create = create.storage_class(StorageClass::ReducedRedundancy);
        }

        let create_response = create
            .send()
            .await
            .map_err(|e| remote("create multipart upload", e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Remote("No upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.config.part_size_bytes.max(1)).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| remote("upload part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| remote("complete multipart upload", e))?;

        Ok(())
    }

    /// Content length of a stored object, `None` if it does not exist
    async fn stored_size(&self, key: &str) -> StorageResult<Option<i64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0))),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(remote("head object", e))
                }
            }
        }
    }

    pub async fn path_is_file(&self, path: &str) -> StorageResult<bool> {
        let key = object_key(path);
        if key.is_empty() {
            return Ok(false);
        }
        Ok(self.stored_size(&key).await?.is_some())
    }

    #[instrument(skip(self))]
    pub async fn rmtree(&self, path: &str) -> StorageResult<bool> {
        let prefix = normalize_dir_prefix(path)?;
        let mut continuation: Option<String> = None;
        let mut deleted = 0usize;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| remote("list objects", e))?;

            let keys: Vec<String> = response
                .contents()
                .iter()
                .filter_map(|obj| obj.key().map(String::from))
                .collect();

            for batch in keys.chunks(DELETE_BATCH) {
                let objects = batch
                    .iter()
                    .map(|k| ObjectIdentifier::builder().key(k).build())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StorageError::Remote(e.to_string()))?;

                let delete = Delete::builder()
                    .set_objects(Some(objects))
                    .quiet(true)
                    .build()
                    .map_err(|e| StorageError::Remote(e.to_string()))?;

                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| remote("delete objects", e))?;

                deleted += batch.len();
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, objects = deleted, "Deleted object store tree");
        Ok(deleted > 0)
    }

    pub async fn remove_file(&self, path: &str) -> StorageResult<()> {
        let key = object_key(path);
        if key.is_empty() {
            return Ok(());
        }

        // DeleteObject succeeds for absent keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| remote("delete object", e))?;
        Ok(())
    }
}

fn remote(operation: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Remote(format!("{} failed: {}", operation, err))
}

/// Object key for a file path: the bucket root has no name.
fn object_key(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Key prefix selecting exactly the "directory" at `path`.
///
/// The root maps to the empty prefix; anything else gets a trailing `/` so
/// sibling keys sharing a name prefix are not matched.
fn normalize_dir_prefix(path: &str) -> StorageResult<String> {
    if path.is_empty() {
        return Err(StorageError::Io("Empty path not allowed".to_string()));
    }

    let mut prefix = object_key(path);
    if !prefix.is_empty() && !prefix.ends_with('/') {
        prefix.push('/');
    }
    Ok(prefix)
}

/// Last path component of a listed key or common prefix.
fn entry_name(key: &str, prefix: &str) -> String {
    let rest = key.strip_prefix(prefix).unwrap_or(key);
    let rest = rest.trim_end_matches('/');
    match rest.rfind('/') {
        Some(i) => rest[i + 1..].to_string(),
        None => rest.to_string(),
    }
}

/// Content type for a published artifact
fn get_content_type(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "html" | "htm" => "text/html; charset=utf-8",
        "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}
