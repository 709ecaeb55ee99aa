//! The file-set reassembly engine.
//!
//! One invocation handles one storage finalize event, end to end: classify
//! the key, and for a header shard list the staging prefix, order it,
//! compose it into the canonical output, and retire the inputs. No state
//! survives between invocations; the object store is the only store of
//! record.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::models::{ObjectRef, StorageEvent};
use crate::services::naming::{self, Role};
use crate::services::ordering;
use crate::services::storage::ObjectStore;
use anyhow::{Result, anyhow};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminal state of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The key is not a header shard; nothing to do. This is the normal
    /// path for body-shard creation events.
    Skipped { key: String },
    /// The staging set was composed into `output_key`.
    Reassembled { output_key: String, sources: usize },
}

pub struct ReassemblyService {
    store: Arc<dyn ObjectStore>,
    config: RelayConfig,
}

impl ReassemblyService {
    pub fn new(store: Arc<dyn ObjectStore>, config: RelayConfig) -> Self {
        Self { store, config }
    }

    /// Runs the per-event state machine.
    ///
    /// Classification and name derivation happen before any storage call,
    /// so malformed keys abort without touching the store. Listing,
    /// compose and the lease are fail-fast; source deletion is per-object
    /// best-effort because the output is already durable by then.
    pub async fn handle_event(&self, event: &StorageEvent) -> Result<Outcome, RelayError> {
        let tags = naming::classify(&event.name);
        if tags.role != Role::Header {
            debug!("ignoring {:?} object {}", tags.role, event.name);
            return Ok(Outcome::Skipped {
                key: event.name.clone(),
            });
        }

        if event.bucket != self.config.container {
            return Err(RelayError::NameDerivation(format!(
                "{}/{} (expected container {})",
                event.bucket, event.name, self.config.container
            )));
        }

        let parts = naming::parse_header_key(&event.name)
            .ok_or_else(|| RelayError::NameDerivation(event.name.clone()))?;
        let prefix = parts.staging_prefix();
        let output_key = parts.output_key();
        let lock_key = parts.lock_key();
        let parts_prefix = parts.parts_prefix();
        info!(
            "header {} triggered reassembly of {}/{}",
            event.name, event.bucket, prefix
        );

        self.acquire_lease(&event.bucket, &lock_key).await?;
        let result = self
            .reassemble(&event.bucket, &prefix, &output_key, &parts_prefix)
            .await;
        if let Err(e) = self.store.delete(&event.bucket, &lock_key).await {
            warn!("failed to release lease {}: {:#}", lock_key, e);
        }
        result
    }

    async fn reassemble(
        &self,
        container: &str,
        prefix: &str,
        output_key: &str,
        parts_prefix: &str,
    ) -> Result<Outcome, RelayError> {
        let listed = self.list_staging(container, prefix).await?;
        if listed.is_empty() {
            // The triggering header must be visible in its own listing. An
            // empty prefix means the store has not converged yet, or a
            // duplicate event arrived after the set was already drained.
            return Err(RelayError::EmptyListing(prefix.to_string()));
        }

        let ordered = ordering::order_for_compose(listed);
        let sources: Vec<String> = ordered.iter().map(|o| o.key.clone()).collect();
        self.compose_all(container, &sources, output_key, parts_prefix)
            .await?;
        info!(
            "reassembled {} objects into {}/{}",
            sources.len(),
            container,
            output_key
        );

        self.delete_sources(container, &ordered).await;

        Ok(Outcome::Reassembled {
            output_key: output_key.to_string(),
            sources: sources.len(),
        })
    }

    async fn list_staging(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectRef>, RelayError> {
        let mut attempt = 0u32;
        loop {
            match self
                .bounded("list", self.store.list(container, prefix))
                .await
            {
                Ok(objects) => return Ok(objects),
                Err(e) if attempt < self.config.list_retries => {
                    attempt += 1;
                    warn!(
                        "listing {}/{} failed (attempt {}): {:#}",
                        container, prefix, attempt, e
                    );
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(e) => {
                    return Err(RelayError::Listing(format!("{container}/{prefix}: {e:#}")));
                }
            }
        }
    }

    /// Composes `sources` into `target`, reducing in batches when the set
    /// exceeds the store's compose fan-in limit. Intermediates live under
    /// the site's `.parts/` area, outside the staging prefix and without
    /// relay tags, so neither a retried listing of `tmp/` nor the
    /// downstream relay can ever pick them up.
    async fn compose_all(
        &self,
        container: &str,
        sources: &[String],
        target: &str,
        parts_prefix: &str,
    ) -> Result<(), RelayError> {
        let mut intermediates: Vec<String> = Vec::new();
        let result = self
            .reduce_and_compose(container, sources, target, parts_prefix, &mut intermediates)
            .await;

        // Cleaned up on success and on failure alike: a redelivered event
        // must start from the untouched sources, nothing else.
        for key in &intermediates {
            if let Err(e) = self.store.delete(container, key).await {
                warn!("failed to delete compose intermediate {}: {:#}", key, e);
            }
        }
        result
    }

    async fn reduce_and_compose(
        &self,
        container: &str,
        sources: &[String],
        target: &str,
        parts_prefix: &str,
        intermediates: &mut Vec<String>,
    ) -> Result<(), RelayError> {
        let fan_in = self.config.compose_fan_in.max(2);
        let mut current: Vec<String> = sources.to_vec();
        let mut generation = 0u32;

        while current.len() > fan_in {
            let mut next = Vec::with_capacity(current.len().div_ceil(fan_in));
            for (index, group) in current.chunks(fan_in).enumerate() {
                let part_key = format!("{parts_prefix}g{generation}-{index:04}.part");
                self.bounded("compose", self.store.compose(container, group, &part_key))
                    .await
                    .map_err(|e| RelayError::Compose(format!("{container}/{part_key}: {e:#}")))?;
                intermediates.push(part_key.clone());
                next.push(part_key);
            }
            current = next;
            generation += 1;
        }

        self.bounded("compose", self.store.compose(container, &current, target))
            .await
            .map_err(|e| RelayError::Compose(format!("{container}/{target}: {e:#}")))
    }

    /// Deletes the listed sources, in parallel since they are independent.
    /// A failed delete leaves an orphan in tmp/ for the periodic sweep; it
    /// never rolls back the already-durable output.
    async fn delete_sources(&self, container: &str, sources: &[ObjectRef]) {
        let timeout = Duration::from_secs(self.config.op_timeout_secs);
        let deletes = sources.iter().map(|object| {
            let store = Arc::clone(&self.store);
            let container = container.to_string();
            let key = object.key.clone();
            async move {
                match tokio::time::timeout(timeout, store.delete(&container, &key)).await {
                    Ok(Ok(())) => debug!("deleted staged object {}", key),
                    Ok(Err(e)) => warn!("failed to delete staged object {}: {:#}", key, e),
                    Err(_) => warn!("timed out deleting staged object {}", key),
                }
            }
        });
        futures::future::join_all(deletes).await;
    }

    /// Takes the per-export lease that keeps two invocations from
    /// composing the same staging prefix at once. A lease older than the
    /// configured TTL belongs to a crashed invocation and is broken.
    async fn acquire_lease(&self, container: &str, lock_key: &str) -> Result<(), RelayError> {
        for attempt in 0..2 {
            let created = self
                .bounded(
                    "lease create",
                    self.store.create_exclusive(container, lock_key, Vec::new()),
                )
                .await
                .map_err(RelayError::Store)?;
            if created {
                debug!("acquired lease {}", lock_key);
                return Ok(());
            }

            let holder = self
                .bounded("lease head", self.store.head(container, lock_key))
                .await
                .map_err(RelayError::Store)?;
            match holder {
                Some(lock) => {
                    let stale = lock
                        .created_at
                        .map(|t| {
                            Utc::now() - t > chrono::Duration::seconds(self.config.lock_ttl_secs)
                        })
                        .unwrap_or(false);
                    if stale && attempt == 0 {
                        warn!("breaking stale lease {}", lock_key);
                        if let Err(e) = self.store.delete(container, lock_key).await {
                            warn!("failed to break stale lease {}: {:#}", lock_key, e);
                        }
                        continue;
                    }
                    return Err(RelayError::Locked(lock_key.to_string()));
                }
                // Holder released between the create and the head; retry.
                None => continue,
            }
        }
        Err(RelayError::Locked(lock_key.to_string()))
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = Duration::from_secs(self.config.op_timeout_secs);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{what} timed out after {timeout:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::MemoryObjectStore;
    use std::sync::atomic::Ordering;

    const CONTAINER: &str = "deidentified_site_recruitment_data_prod";
    const HEADER_KEY: &str = "Sanford/tmp/Sanford_deidentified_recruitment_data_box_folder_227964841688_file_id_1318220507784_HEADER_000000000000.csv";
    const OUTPUT_KEY: &str = "Sanford/Sanford_deidentified_recruitment_data_boxfolder_227964841688_fileid_1318220507784.csv";

    fn body_key(counter: &str) -> String {
        format!(
            "Sanford/tmp/Sanford_deidentified_recruitment_data_box_folder_227964841688_file_id_1318220507784_BODY_{counter}.csv"
        )
    }

    fn header_event() -> StorageEvent {
        StorageEvent {
            bucket: CONTAINER.to_string(),
            name: HEADER_KEY.to_string(),
        }
    }

    fn service(store: Arc<MemoryObjectStore>, config: RelayConfig) -> ReassemblyService {
        ReassemblyService::new(store, config)
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            list_retries: 0,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_body_event_touches_nothing() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = service(Arc::clone(&store), test_config());

        let event = StorageEvent {
            bucket: CONTAINER.to_string(),
            name: body_key("000000000000"),
        };
        let outcome = engine.handle_event(&event).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped { .. }));
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.compose_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_header_key_aborts_before_storage() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = service(Arc::clone(&store), test_config());

        // Extra path segment: classified as a header, but the strict
        // structural parse refuses to derive an output name.
        let event = StorageEvent {
            bucket: CONTAINER.to_string(),
            name: format!("Sanford/extra/{}", HEADER_KEY.split_once('/').unwrap().1),
        };
        let err = engine.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::NameDerivation(_)));
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.compose_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unexpected_container_aborts() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = service(Arc::clone(&store), test_config());

        let event = StorageEvent {
            bucket: "some-other-bucket".to_string(),
            name: HEADER_KEY.to_string(),
        };
        let err = engine.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::NameDerivation(_)));
    }

    #[tokio::test]
    async fn test_reassembles_and_drains_staging_set() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"col_a,col_b\n");
        store.put(CONTAINER, &body_key("000000000001"), b"3,4\n");
        store.put(CONTAINER, &body_key("000000000000"), b"1,2\n");

        let engine = service(Arc::clone(&store), test_config());
        let outcome = engine.handle_event(&header_event()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Reassembled {
                output_key: OUTPUT_KEY.to_string(),
                sources: 3,
            }
        );

        assert_eq!(
            store.get(CONTAINER, OUTPUT_KEY).unwrap(),
            b"col_a,col_b\n1,2\n3,4\n"
        );
        // Staging drained, lease released: only the output remains.
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_empty_listing_is_surfaced_for_redelivery() {
        let store = Arc::new(MemoryObjectStore::new());
        let engine = service(Arc::clone(&store), test_config());

        let err = engine.handle_event(&header_event()).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyListing(_)));
        // The lease must not linger after a failed run.
        assert!(store.keys(CONTAINER).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_event_after_drain_is_harmless() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"h\n");
        store.put(CONTAINER, &body_key("000000000000"), b"b\n");

        let engine = service(Arc::clone(&store), test_config());
        engine.handle_event(&header_event()).await.unwrap();

        // At-least-once delivery: the same header event again.
        let err = engine.handle_event(&header_event()).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyListing(_)));

        // Exactly one output, no duplicates, nothing staged.
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
        assert_eq!(store.get(CONTAINER, OUTPUT_KEY).unwrap(), b"h\nb\n");
    }

    #[tokio::test]
    async fn test_batched_compose_beyond_fan_in() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"H");
        let mut expected = b"H".to_vec();
        for i in 0..9 {
            let counter = format!("{i:012}");
            let byte = [b'0' + i as u8];
            store.put(CONTAINER, &body_key(&counter), &byte);
            expected.extend_from_slice(&byte);
        }

        let config = RelayConfig {
            compose_fan_in: 4,
            list_retries: 0,
            ..RelayConfig::default()
        };
        let engine = service(Arc::clone(&store), config);
        let outcome = engine.handle_event(&header_event()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Reassembled {
                output_key: OUTPUT_KEY.to_string(),
                sources: 10,
            }
        );

        assert_eq!(store.get(CONTAINER, OUTPUT_KEY).unwrap(), expected);
        // No intermediate .part objects or staged shards left behind.
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_batched_compose_leaves_sources_for_clean_retry() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"H");
        for i in 0..3 {
            store.put(CONTAINER, &body_key(&format!("{i:012}")), &[b'0' + i as u8]);
        }
        let staged: Vec<String> = store.keys(CONTAINER);

        let config = RelayConfig {
            compose_fan_in: 2,
            list_retries: 0,
            ..RelayConfig::default()
        };
        let engine = service(Arc::clone(&store), config);

        // The final compose of the reduction fails.
        store.fail_compose_on(OUTPUT_KEY);
        let err = engine.handle_event(&header_event()).await.unwrap_err();
        assert!(matches!(err, RelayError::Compose(_)));

        // No output, no leftover intermediates, no lingering lease: the
        // container holds exactly the untouched sources, and a listing of
        // the staging prefix sees only them.
        assert_eq!(store.keys(CONTAINER), staged);
        let listed = store.list(CONTAINER, "Sanford/tmp/").await.unwrap();
        assert_eq!(listed.len(), staged.len());

        // Redelivery now succeeds with every source byte exactly once.
        let outcome = engine.handle_event(&header_event()).await.unwrap();
        assert!(matches!(outcome, Outcome::Reassembled { sources: 4, .. }));
        assert_eq!(store.get(CONTAINER, OUTPUT_KEY).unwrap(), b"H012");
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_intermediates_are_cleaned_up_after_success() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"H");
        for i in 0..3 {
            store.put(CONTAINER, &body_key(&format!("{i:012}")), &[b'0' + i as u8]);
        }

        let config = RelayConfig {
            compose_fan_in: 2,
            list_retries: 0,
            ..RelayConfig::default()
        };
        let engine = service(Arc::clone(&store), config);
        engine.handle_event(&header_event()).await.unwrap();

        // The reduction ran through .parts/ and left nothing behind.
        assert!(store
            .list(CONTAINER, "Sanford/.parts/")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_source_delete_is_non_fatal() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"h\n");
        store.put(CONTAINER, &body_key("000000000000"), b"1\n");
        store.put(CONTAINER, &body_key("000000000001"), b"2\n");
        store.fail_delete_on(&body_key("000000000000"));

        let engine = service(Arc::clone(&store), test_config());
        let outcome = engine.handle_event(&header_event()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Reassembled {
                output_key: OUTPUT_KEY.to_string(),
                sources: 3,
            }
        );

        // The output stays durable and the other sources were still
        // retired; only the failed delete's object is orphaned in tmp/.
        assert_eq!(store.get(CONTAINER, OUTPUT_KEY).unwrap(), b"h\n1\n2\n");
        assert!(store.get(CONTAINER, HEADER_KEY).is_none());
        assert!(store.get(CONTAINER, &body_key("000000000001")).is_none());
        assert!(store.get(CONTAINER, &body_key("000000000000")).is_some());
    }

    #[tokio::test]
    async fn test_held_lease_defers_the_invocation() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"h\n");
        store.put(CONTAINER, "Sanford/.locks/1318220507784.lock", b"");

        let engine = service(Arc::clone(&store), test_config());
        let err = engine.handle_event(&header_event()).await.unwrap_err();
        assert!(matches!(err, RelayError::Locked(_)));
        assert_eq!(store.compose_calls.load(Ordering::SeqCst), 0);
        // The competing holder keeps its lease and its staging set.
        assert!(store.get(CONTAINER, HEADER_KEY).is_some());
    }

    #[tokio::test]
    async fn test_stale_lease_is_broken() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"h\n");
        store.put_with_created_at(
            CONTAINER,
            "Sanford/.locks/1318220507784.lock",
            b"",
            Utc::now() - chrono::Duration::seconds(3600),
        );

        let engine = service(Arc::clone(&store), test_config());
        let outcome = engine.handle_event(&header_event()).await.unwrap();
        assert!(matches!(outcome, Outcome::Reassembled { .. }));
        assert_eq!(store.keys(CONTAINER), vec![OUTPUT_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_lock_key_outside_staging_prefix_is_not_composed() {
        // The lease must never end up inside the output bytes.
        let store = Arc::new(MemoryObjectStore::new());
        store.put(CONTAINER, HEADER_KEY, b"h\n");
        store.put(CONTAINER, &body_key("000000000000"), b"b\n");

        let engine = service(Arc::clone(&store), test_config());
        engine.handle_event(&header_event()).await.unwrap();
        assert_eq!(store.get(CONTAINER, OUTPUT_KEY).unwrap(), b"h\nb\n");
    }
}
