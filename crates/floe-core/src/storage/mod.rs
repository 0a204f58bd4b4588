//! Storage abstraction over OneLake / Azure Data Lake and the local filesystem.
//!
//! All paths handed to a [`StorageProvider`] are relative to the key prefix
//! embedded in its URL, and listings strip that prefix again.

mod azure;
mod local;
mod url_parser;

pub use url_parser::BackendConfig;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt, future::ready};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutMode, PutOptions,
    PutPayload,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    ActiveMultipartParts, MultipartUploadCompleted, RequestStatus, StorageOperation,
    StorageRequest, StorageRequestDuration,
};

pub use azure::AzureConfig;
pub use local::LocalConfig;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// How a published file is moved to its final name.
///
/// `Hierarchical` issues a no-clobber rename, `Flat` a no-clobber copy and
/// a separate delete of the source. object_store renames natively only where
/// the backend can; on Azure and local disks the rename is itself a
/// no-clobber copy followed by a delete. OneLake exposes the same data over
/// a DFS (hierarchical) and a Blob (flat) endpoint; the endpoint in the URL
/// decides the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Hierarchical,
    Flat,
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceKind::Hierarchical => write!(f, "hierarchical"),
            NamespaceKind::Flat => write!(f, "flat"),
        }
    }
}

/// One level of a listing: objects directly under a prefix plus the child
/// "folders" (common prefixes).
#[derive(Debug, Default)]
pub struct DirectoryListing {
    pub objects: Vec<ObjectMeta>,
    pub folders: Vec<Path>,
}

impl DirectoryListing {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.folders.is_empty()
    }
}

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// Present on backends with explicit part numbering (Azure); local has none.
    pub(crate) multipart_store: Option<Arc<dyn MultipartStore>>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn emit_request<T, E>(operation: StorageOperation, start: Instant, result: &Result<T, E>) {
    let status = if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::Azure(config) => Self::construct_azure(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Canonical URL of the store root (including the key prefix).
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get storage options the provider was built with.
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The backend store requests are sent to.
    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    /// Route requests through `store` instead, keeping URL and key prefix.
    ///
    /// Used to layer a wrapping store (instrumentation, fault injection) over
    /// the backend built from the URL. Multipart uploads bypass the wrapper.
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = store;
        self
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    fn key_part_count(&self) -> usize {
        self.config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default()
    }

    fn relative(&self, path: &Path) -> Path {
        path.parts().skip(self.key_part_count()).collect()
    }

    /// List one level under `prefix`, sorted by name.
    ///
    /// A prefix with nothing under it yields an empty listing; object stores
    /// have no standalone directories.
    pub async fn list_directory(&self, prefix: &Path) -> Result<DirectoryListing, StorageError> {
        let qualified = self.qualify_path(prefix);
        let start = Instant::now();
        let result = self.object_store.list_with_delimiter(Some(&qualified)).await;
        emit_request(StorageOperation::List, start, &result);

        let result = match result {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(DirectoryListing::default()),
            Err(source) => return Err(StorageError::ObjectStore { source }),
        };

        let mut objects: Vec<ObjectMeta> = result
            .objects
            .into_iter()
            .map(|meta| ObjectMeta {
                location: self.relative(&meta.location),
                ..meta
            })
            .collect();
        objects.sort_by(|a, b| a.location.cmp(&b.location));

        let mut folders: Vec<Path> = result
            .common_prefixes
            .iter()
            .map(|p| self.relative(p))
            .collect();
        folders.sort();

        Ok(DirectoryListing { objects, folders })
    }

    /// Recursively list objects under a prefix (relative to the configured base prefix).
    pub async fn list_with_prefix(
        &self,
        prefix: &Path,
    ) -> Result<impl Stream<Item = Result<ObjectMeta, object_store::Error>> + '_, StorageError>
    {
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        let full_prefix = self.qualify_path(prefix).into_owned();
        let key_part_count = self.key_part_count();

        let list = self
            .object_store
            .list(Some(&full_prefix))
            .filter_map(move |meta| {
                let result = meta.map(|meta| ObjectMeta {
                    location: meta.location.parts().skip(key_part_count).collect(),
                    ..meta
                });
                ready(Some(result))
            });

        Ok(list)
    }

    /// Fetch object metadata.
    pub async fn head(&self, path: &Path) -> Result<ObjectMeta, StorageError> {
        let start = Instant::now();
        let result = self.object_store.head(&self.qualify_path(path)).await;
        emit_request(StorageOperation::Head, start, &result);

        let meta = result.context(ObjectStoreSnafu)?;
        Ok(ObjectMeta {
            location: self.relative(&meta.location),
            ..meta
        })
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(path)).await;
        emit_request(StorageOperation::Get, start, &result);

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Put a payload to a path, overwriting anything already there.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        self.put_payload_with_opts(path, payload, PutOptions::default())
            .await
    }

    /// Put a payload only if nothing exists at `path` yet.
    ///
    /// Fails with an "already exists" error (see [`StorageError::is_already_exists`])
    /// when the object is present.
    pub async fn put_if_absent(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    /// Put a Parquet file with `Content-Type: application/vnd.apache.parquet`.
    ///
    /// Local filesystem doesn't support attributes, so they are skipped.
    pub async fn put_parquet(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        if matches!(self.config, BackendConfig::Local(_)) {
            return self.put_payload(path, payload).await;
        }

        let opts = PutOptions {
            attributes: Attributes::from_iter([(
                Attribute::ContentType,
                AttributeValue::from("application/vnd.apache.parquet"),
            )]),
            ..Default::default()
        };
        self.put_payload_with_opts(path, payload, opts).await
    }

    async fn put_payload_with_opts(
        &self,
        path: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put_opts(&path, payload, opts).await;
        emit_request(StorageOperation::Put, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete a file at the given path.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.delete(&path).await;
        emit_request(StorageOperation::Delete, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Delete a file, treating "not found" as success.
    ///
    /// Returns whether an object was actually removed.
    pub async fn delete_if_exists(&self, path: &Path) -> Result<bool, StorageError> {
        match self.delete(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Atomically replace the content at a path using temp file + rename.
    ///
    /// 1. Write to `{path}.tmp`
    /// 2. Rename `{path}.tmp` to `{path}`
    ///
    /// If the write or rename fails, the original file (if any) is unchanged.
    pub async fn atomic_write(&self, path: &Path, content: Vec<u8>) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put_payload(&temp_path, PutPayload::from(Bytes::from(content)))
            .await?;
        self.rename(&temp_path, path).await
    }

    /// Server-side rename, overwriting the destination.
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_qualified = self.qualify_path(from);
        let to_qualified = self.qualify_path(to);
        let start = Instant::now();
        let result = self
            .object_store
            .rename(&from_qualified, &to_qualified)
            .await;
        emit_request(StorageOperation::Rename, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Rename that fails if `to` already exists.
    ///
    /// Local filesystems implement this with a hard link plus unlink, so the
    /// destination appears in one step.
    pub async fn rename_if_not_exists(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_qualified = self.qualify_path(from);
        let to_qualified = self.qualify_path(to);
        let start = Instant::now();
        let result = self
            .object_store
            .rename_if_not_exists(&from_qualified, &to_qualified)
            .await;
        emit_request(StorageOperation::Rename, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Server-side copy that fails if `to` already exists.
    pub async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from_qualified = self.qualify_path(from);
        let to_qualified = self.qualify_path(to);
        let start = Instant::now();
        let result = self
            .object_store
            .copy_if_not_exists(&from_qualified, &to_qualified)
            .await;
        emit_request(StorageOperation::Copy, start, &result);

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Upload bytes using parallel multipart upload.
    ///
    /// Backends without `MultipartStore`, and payloads smaller than
    /// `min_multipart_size`, use a single PUT.
    pub async fn put_multipart_bytes(
        &self,
        path: &Path,
        bytes: Bytes,
        part_size: usize,
        min_multipart_size: usize,
        max_concurrent_parts: usize,
    ) -> Result<(), StorageError> {
        let multipart_store = match &self.multipart_store {
            Some(store) if bytes.len() >= min_multipart_size => store.clone(),
            _ => return self.put_payload(path, PutPayload::from(bytes)).await,
        };

        let qualified_path = self.qualify_path(path).into_owned();

        let create_start = Instant::now();
        let create_result = multipart_store.create_multipart(&qualified_path).await;
        emit_request(StorageOperation::CreateMultipart, create_start, &create_result);
        let multipart_id = create_result.context(ObjectStoreSnafu)?;

        let parts: Vec<(usize, Bytes)> = (0..)
            .zip((0..bytes.len()).step_by(part_size.max(1)))
            .map(|(i, offset)| {
                let end = std::cmp::min(offset + part_size, bytes.len());
                (i, bytes.slice(offset..end))
            })
            .collect();

        let total_parts = parts.len();
        debug!(
            "Starting multipart upload for {} ({} bytes, {} parts, concurrency={})",
            path,
            bytes.len(),
            total_parts,
            max_concurrent_parts
        );

        let multipart_id = Arc::new(multipart_id);
        let qualified_path = Arc::new(qualified_path);
        let active_parts = Arc::new(AtomicUsize::new(0));

        let upload: Result<Vec<(usize, PartId)>, StorageError> = futures::stream::iter(parts)
            .map(|(idx, data)| {
                let multipart_store = multipart_store.clone();
                let qualified_path = qualified_path.clone();
                let multipart_id = multipart_id.clone();
                let active_parts = active_parts.clone();
                async move {
                    let count = active_parts.fetch_add(1, Ordering::Relaxed) + 1;
                    emit!(ActiveMultipartParts { count });

                    let part_start = Instant::now();
                    let result = multipart_store
                        .put_part(&qualified_path, &multipart_id, idx, data.into())
                        .await;
                    emit_request(StorageOperation::PutPart, part_start, &result);

                    let count = active_parts.fetch_sub(1, Ordering::Relaxed) - 1;
                    emit!(ActiveMultipartParts { count });

                    let part_id = result.context(ObjectStoreSnafu)?;
                    Ok::<_, StorageError>((idx, part_id))
                }
            })
            .buffer_unordered(max_concurrent_parts.max(1))
            .try_collect()
            .await;

        let mut results = match upload {
            Ok(results) => results,
            Err(e) => {
                // Uncommitted blocks expire server-side; aborting is best-effort.
                let _ = multipart_store
                    .abort_multipart(&qualified_path, &multipart_id)
                    .await;
                return Err(e);
            }
        };

        // Parts may complete out of order
        results.sort_by_key(|(idx, _)| *idx);
        let part_ids: Vec<PartId> = results.into_iter().map(|(_, id)| id).collect();

        let complete_start = Instant::now();
        let complete_result = multipart_store
            .complete_multipart(&qualified_path, &multipart_id, part_ids)
            .await;
        emit_request(
            StorageOperation::CompleteMultipart,
            complete_start,
            &complete_result,
        );

        complete_result.context(ObjectStoreSnafu)?;
        emit!(MultipartUploadCompleted);
        debug!("Completed multipart upload for {path}");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn local_provider(dir: &TempDir) -> StorageProvider {
        StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_directory_splits_objects_and_folders() {
        let temp_dir = TempDir::new().unwrap();
        let table = temp_dir.path().join("Sales/Files/LandingZone/Orders");
        std::fs::create_dir_all(table.join("_ProcessedFiles")).unwrap();
        std::fs::write(table.join("_metadata.json"), b"{}").unwrap();
        std::fs::write(table.join("00000000000000000002.parquet"), b"b").unwrap();
        std::fs::write(table.join("00000000000000000001.parquet"), b"a").unwrap();
        std::fs::write(table.join("_ProcessedFiles/old.parquet"), b"old").unwrap();

        let storage = local_provider(&temp_dir).await;
        let listing = storage
            .list_directory(&Path::from("Sales/Files/LandingZone/Orders"))
            .await
            .unwrap();

        let names: Vec<_> = listing
            .objects
            .iter()
            .map(|m| m.location.filename().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "00000000000000000001.parquet",
                "00000000000000000002.parquet",
                "_metadata.json"
            ]
        );
        assert_eq!(
            listing.folders,
            vec![Path::from("Sales/Files/LandingZone/Orders/_ProcessedFiles")]
        );
    }

    #[tokio::test]
    async fn test_list_directory_missing_prefix_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;

        let listing = storage
            .list_directory(&Path::from("does/not/exist"))
            .await
            .unwrap();
        assert!(listing.is_empty());
    }

    #[tokio::test]
    async fn test_list_with_prefix_returns_relative_paths() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("t/_FilesReadyToDelete/batch");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.parquet"), b"a").unwrap();

        let storage = local_provider(&temp_dir).await;
        let paths: Vec<String> = storage
            .list_with_prefix(&Path::from("t/_FilesReadyToDelete"))
            .await
            .unwrap()
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .unwrap();

        assert_eq!(paths, vec!["t/_FilesReadyToDelete/batch/a.parquet"]);
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_existing() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;
        let path = Path::from("t/_metadata.json");

        storage
            .put_if_absent(&path, PutPayload::from_static(b"first"))
            .await
            .unwrap();
        let err = storage
            .put_if_absent(&path, PutPayload::from_static(b"second"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        let content = storage.get(&path).await.unwrap();
        assert_eq!(content.as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_rename_if_not_exists() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;
        let temp = Path::from("t/_00000000000000000001.parquet.temp");
        let fin = Path::from("t/00000000000000000001.parquet");

        storage
            .put_payload(&temp, PutPayload::from_static(b"data"))
            .await
            .unwrap();
        storage.rename_if_not_exists(&temp, &fin).await.unwrap();

        assert!(storage.head(&temp).await.unwrap_err().is_not_found());
        assert_eq!(storage.get(&fin).await.unwrap().as_ref(), b"data");

        // A second rename onto the same name must not clobber it
        storage
            .put_payload(&temp, PutPayload::from_static(b"other"))
            .await
            .unwrap();
        let err = storage.rename_if_not_exists(&temp, &fin).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(storage.get(&fin).await.unwrap().as_ref(), b"data");
    }

    #[tokio::test]
    async fn test_copy_if_not_exists_keeps_source() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;
        let src = Path::from("t/_x.temp");
        let dst = Path::from("t/x");

        storage
            .put_payload(&src, PutPayload::from_static(b"data"))
            .await
            .unwrap();
        storage.copy_if_not_exists(&src, &dst).await.unwrap();

        assert_eq!(storage.get(&src).await.unwrap().as_ref(), b"data");
        assert_eq!(storage.get(&dst).await.unwrap().as_ref(), b"data");
    }

    #[tokio::test]
    async fn test_delete_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;
        let path = Path::from("t/file");

        assert!(!storage.delete_if_exists(&path).await.unwrap());
        storage
            .put_payload(&path, PutPayload::from_static(b"x"))
            .await
            .unwrap();
        assert!(storage.delete_if_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_atomic_write_overwrites_existing() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("state.json"), b"old content").unwrap();
        let storage = local_provider(&temp_dir).await;

        let path = Path::from("state.json");
        storage
            .atomic_write(&path, b"new content".to_vec())
            .await
            .unwrap();

        let read_content = storage.get(&path).await.unwrap();
        assert_eq!(read_content.as_ref(), b"new content");
        assert!(!temp_dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_multipart_falls_back_to_put_on_local() {
        let temp_dir = TempDir::new().unwrap();
        let storage = local_provider(&temp_dir).await;
        let path = Path::from("t/big");

        storage
            .put_multipart_bytes(&path, Bytes::from(vec![7u8; 4096]), 1024, 0, 4)
            .await
            .unwrap();
        assert_eq!(storage.get(&path).await.unwrap().len(), 4096);
    }
}
