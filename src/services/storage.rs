use crate::models::ObjectRef;
use anyhow::{Result, anyhow, bail};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Object store operations the reassembly engine depends on.
///
/// Injected as a trait object so the engine never reaches into ambient
/// globals. `list` must be strongly consistent with respect to the write
/// that triggered the invocation, and `compose` must be a server-side
/// concatenation with no client byte streaming.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`. An empty Vec is a
    /// successful empty listing, distinct from a listing failure.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectRef>>;

    /// Concatenates `sources` in order into `target`, server side.
    async fn compose(&self, container: &str, sources: &[String], target: &str) -> Result<()>;

    /// Deletes a key. Deleting a key that no longer exists succeeds.
    async fn delete(&self, container: &str, key: &str) -> Result<()>;

    /// Metadata for one key, or `None` if it does not exist.
    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectRef>>;

    /// Creates `key` only if it does not already exist. Returns `false`
    /// when another writer holds the key.
    async fn create_exclusive(&self, container: &str, key: &str, body: Vec<u8>) -> Result<bool>;
}

/// S3-compatible store (MinIO in development).
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn copy_parts(
        &self,
        container: &str,
        sources: &[String],
        target: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let part_number = (index + 1) as i32;
            let copied = self
                .client
                .upload_part_copy()
                .bucket(container)
                .key(target)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(format!("{}/{}", container, source))
                .send()
                .await?;
            parts.push(
                CompletedPart::builder()
                    .e_tag(
                        copied
                            .copy_part_result()
                            .and_then(|r| r.e_tag())
                            .unwrap_or_default(),
                    )
                    .part_number(part_number)
                    .build(),
            );
        }
        Ok(parts)
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectRef>> {
        let mut refs = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix);
            if let Some(token) = continuation {
                request = request.continuation_token(token);
            }
            let page = request.send().await?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                refs.push(ObjectRef {
                    container: container.to_string(),
                    key: key.to_string(),
                    size: object.size(),
                    created_at: object.last_modified().and_then(to_chrono),
                });
            }

            continuation = page.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }

        Ok(refs)
    }

    /// Server-side concatenation via multipart copy: every part is copied
    /// within the store, no bytes flow through this process. All parts
    /// except the last must meet the store's minimum part size, which is
    /// checked up front so the failure names the offending object instead
    /// of surfacing as an opaque EntityTooSmall at completion time.
    async fn compose(&self, container: &str, sources: &[String], target: &str) -> Result<()> {
        if sources.is_empty() {
            bail!("compose requires at least one source");
        }

        let mut sized = Vec::with_capacity(sources.len());
        for source in sources {
            match self.head(container, source).await? {
                Some(object) => sized.push((source.clone(), object.size.unwrap_or(0))),
                None => bail!("source object vanished: {}/{}", container, source),
            }
        }
        if let Some((key, size)) = undersized_part(&sized) {
            bail!(
                "cannot compose {}/{}: non-final source {} is {} bytes, below the {} byte multipart minimum",
                container,
                target,
                key,
                size,
                MIN_COMPOSE_PART_SIZE
            );
        }

        let started = self
            .client
            .create_multipart_upload()
            .bucket(container)
            .key(target)
            .send()
            .await?;
        let upload_id = started
            .upload_id()
            .ok_or_else(|| anyhow!("no upload ID"))?
            .to_string();

        let parts = match self.copy_parts(container, sources, target, &upload_id).await {
            Ok(parts) => parts,
            Err(e) => {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(container)
                    .key(target)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(container)
            .key(target)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await?;

        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<()> {
        // S3 deletes are idempotent: deleting a missing key is a 204.
        self.client
            .delete_object()
            .bucket(container)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectRef>> {
        let res = self
            .client
            .head_object()
            .bucket(container)
            .key(key)
            .send()
            .await;

        match res {
            Ok(output) => Ok(Some(ObjectRef {
                container: container.to_string(),
                key: key.to_string(),
                size: output.content_length(),
                created_at: output.last_modified().and_then(to_chrono),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!(service_error))
                }
            }
        }
    }

    async fn create_exclusive(&self, container: &str, key: &str, body: Vec<u8>) -> Result<bool> {
        let res = self
            .client
            .put_object()
            .bucket(container)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(body))
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            // 412: the key already exists, someone else won the race.
            Err(SdkError::ServiceError(ctx)) if ctx.raw().status().as_u16() == 412 => Ok(false),
            Err(e) => Err(anyhow!(e)),
        }
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

/// Minimum size for every multipart part except the final one.
const MIN_COMPOSE_PART_SIZE: i64 = 5 * 1024 * 1024;

/// First non-final source below the multipart minimum, if any. The last
/// part may be any size.
fn undersized_part(sized: &[(String, i64)]) -> Option<&(String, i64)> {
    let (_, non_final) = sized.split_last()?;
    non_final
        .iter()
        .find(|(_, size)| *size < MIN_COMPOSE_PART_SIZE)
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// In-process store double for tests and local development. Compose is
/// byte-accurate so end-to-end tests can assert on concatenated content.
/// Call counters let tests assert which storage operations ran, and
/// failures can be injected per key to exercise error paths.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    fail_compose_targets: Mutex<Vec<String>>,
    fail_delete_keys: Mutex<Vec<String>>,
    pub list_calls: AtomicUsize,
    pub compose_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, container: &str, key: &str, data: &[u8]) {
        self.put_with_created_at(container, key, data, Utc::now());
    }

    pub fn put_with_created_at(
        &self,
        container: &str,
        key: &str,
        data: &[u8],
        created_at: DateTime<Utc>,
    ) {
        self.objects.lock().unwrap().insert(
            (container.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                created_at,
            },
        );
    }

    pub fn get(&self, container: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(container.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Makes the next compose into `target` fail once.
    pub fn fail_compose_on(&self, target: &str) {
        self.fail_compose_targets
            .lock()
            .unwrap()
            .push(target.to_string());
    }

    /// Makes every delete of `key` fail.
    pub fn fail_delete_on(&self, key: &str) {
        self.fail_delete_keys.lock().unwrap().push(key.to_string());
    }

    pub fn keys(&self, container: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<ObjectRef>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((c, k), _)| c == container && k.starts_with(prefix))
            .map(|((c, k), o)| ObjectRef {
                container: c.clone(),
                key: k.clone(),
                size: Some(o.data.len() as i64),
                created_at: Some(o.created_at),
            })
            .collect())
    }

    async fn compose(&self, container: &str, sources: &[String], target: &str) -> Result<()> {
        self.compose_calls.fetch_add(1, Ordering::SeqCst);
        if sources.is_empty() {
            bail!("compose requires at least one source");
        }

        {
            let mut failures = self.fail_compose_targets.lock().unwrap();
            if let Some(position) = failures.iter().position(|t| t == target) {
                failures.remove(position);
                bail!("injected compose failure for {}/{}", container, target);
            }
        }

        let mut objects = self.objects.lock().unwrap();
        let mut data = Vec::new();
        for source in sources {
            let stored = objects
                .get(&(container.to_string(), source.clone()))
                .ok_or_else(|| anyhow!("source object vanished: {}/{}", container, source))?;
            data.extend_from_slice(&stored.data);
        }
        objects.insert(
            (container.to_string(), target.to_string()),
            StoredObject {
                data,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_delete_keys
            .lock()
            .unwrap()
            .iter()
            .any(|k| k == key)
        {
            bail!("injected delete failure for {}/{}", container, key);
        }
        self.objects
            .lock()
            .unwrap()
            .remove(&(container.to_string(), key.to_string()));
        Ok(())
    }

    async fn head(&self, container: &str, key: &str) -> Result<Option<ObjectRef>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(&(container.to_string(), key.to_string()))
            .map(|o| ObjectRef {
                container: container.to_string(),
                key: key.to_string(),
                size: Some(o.data.len() as i64),
                created_at: Some(o.created_at),
            }))
    }

    async fn create_exclusive(&self, container: &str, key: &str, body: Vec<u8>) -> Result<bool> {
        let mut objects = self.objects.lock().unwrap();
        let entry = (container.to_string(), key.to_string());
        if objects.contains_key(&entry) {
            return Ok(false);
        }
        objects.insert(
            entry,
            StoredObject {
                data: body,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }
}
