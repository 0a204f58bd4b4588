//! Test helpers shared by unit tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult,
};
use tempfile::TempDir;

use floe_core::{StorageProvider, StorageProviderRef};

/// Object store wrapper that counts requests and can refuse puts or deletes.
///
/// Only the required trait methods are forwarded, so provided methods such
/// as `head` and `rename_if_not_exists` run their default implementations on
/// top of the wrapper, the way a backend without native support does.
#[derive(Debug)]
pub(crate) struct CountingStore {
    inner: Arc<dyn ObjectStore>,
    requests: AtomicUsize,
    lists: AtomicUsize,
    deletes: AtomicUsize,
    refuse_puts: AtomicBool,
    refuse_deletes: AtomicBool,
}

impl CountingStore {
    pub(crate) fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            requests: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            refuse_puts: AtomicBool::new(false),
            refuse_deletes: AtomicBool::new(false),
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse_puts(&self, refuse: bool) {
        self.refuse_puts.store(refuse, Ordering::SeqCst);
    }

    pub(crate) fn refuse_deletes(&self, refuse: bool) {
        self.refuse_deletes.store(refuse, Ordering::SeqCst);
    }

    fn request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

fn refused(operation: &str) -> object_store::Error {
    object_store::Error::Generic {
        store: "Counting",
        source: format!("{operation} refused").into(),
    }
}

impl fmt::Display for CountingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Counting({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.request();
        if self.refuse_puts.load(Ordering::SeqCst) {
            return Err(refused("put"));
        }
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.request();
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.request();
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.request();
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.refuse_deletes.load(Ordering::SeqCst) {
            return Err(refused("delete"));
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.request();
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.request();
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.request();
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.request();
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// A local storage provider over `dir` with every request counted.
pub(crate) async fn counting_storage(dir: &TempDir) -> (StorageProviderRef, Arc<CountingStore>) {
    let storage = StorageProvider::for_url_with_options(dir.path().to_str().unwrap(), HashMap::new())
        .await
        .unwrap();
    let counting = Arc::new(CountingStore::new(storage.object_store()));
    let storage = storage.with_object_store(counting.clone());
    (Arc::new(storage), counting)
}
