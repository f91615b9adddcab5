use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::KvStore;
use crate::error::Error;

/// Largest body stored as a single KV object. Bodies at the ceiling stay
/// single-part; one byte more switches to chunked layout.
const DEFAULT_SINGLE_PART_CEILING: usize = 20 * 1024 * 1024;

/// Chunk size for chunked objects. Never exceeds the per-object ceiling.
const DEFAULT_CHUNK_SIZE: usize = 20 * 1024 * 1024;

/// Content metadata carried alongside a variant body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantMeta {
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// KV metadata for a variant entry. `Single` entries carry their body
/// directly; `Chunked` entries are a manifest over `chunk_count` sibling keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum VariantRecord {
    #[serde(rename_all = "camelCase")]
    Single {
        size: u64,
        sha256: String,
        written_at: u64,
        ttl_secs: u64,
        #[serde(flatten)]
        meta: VariantMeta,
    },
    #[serde(rename_all = "camelCase")]
    Chunked {
        total_size: u64,
        chunk_count: u32,
        chunk_size: u64,
        sha256: String,
        written_at: u64,
        ttl_secs: u64,
        #[serde(flatten)]
        meta: VariantMeta,
    },
}

/// Chunk sidecar: offset and length within the assembled body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRecord {
    offset: u64,
    length: u64,
}

/// A variant served from the store. `range` is set when only a byte range was
/// assembled; `total_size` always refers to the complete body.
#[derive(Debug, Clone)]
pub struct StoredVariant {
    pub meta: VariantMeta,
    pub total_size: u64,
    pub body: Bytes,
    pub range: Option<(u64, u64)>,
}

#[derive(Debug)]
pub enum VariantRead {
    Hit(StoredVariant),
    /// Entry absent.
    Miss,
    /// Entry present but failed integrity verification; treated as absent by
    /// callers, logged here.
    CorruptMiss,
    /// Entry present but the requested range starts past the end of the body.
    /// Carries the total size for the `Content-Range: bytes */{total}` answer.
    Unsatisfiable(u64),
}

impl VariantRead {
    pub fn into_option(self) -> Option<StoredVariant> {
        match self {
            Self::Hit(v) => Some(v),
            _ => None,
        }
    }
}

/// Content-addressed store for transformed variants, keyed by the canonical
/// `(path, options, version)` hash. Large bodies use a chunked layout with the
/// manifest written last, so a readable manifest implies readable chunks.
pub struct VariantStore {
    store: Arc<dyn KvStore>,
    single_part_ceiling: usize,
    chunk_size: usize,
    refresh_age_fraction: f64,
    refresh_ttl_multiplier: f64,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl VariantStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            single_part_ceiling: DEFAULT_SINGLE_PART_CEILING,
            chunk_size: DEFAULT_CHUNK_SIZE,
            refresh_age_fraction: 0.5,
            refresh_ttl_multiplier: 2.0,
        }
    }

    /// Override the storage geometry (tests use small sizes).
    pub fn with_geometry(mut self, single_part_ceiling: usize, chunk_size: usize) -> Self {
        self.single_part_ceiling = single_part_ceiling;
        self.chunk_size = chunk_size.min(single_part_ceiling).max(1);
        self
    }

    pub fn with_refresh_policy(mut self, age_fraction: f64, ttl_multiplier: f64) -> Self {
        self.refresh_age_fraction = age_fraction;
        self.refresh_ttl_multiplier = ttl_multiplier;
        self
    }

    fn entry_key(key: &str) -> String {
        format!("variant:{}", key)
    }

    fn chunk_key(key: &str, index: u32) -> String {
        format!("variant:{}:chunk:{}", key, index)
    }

    /// Store a variant body. Chunks are written before the manifest: a crash
    /// mid-write leaves orphan chunks that TTL out, never a dangling manifest.
    pub async fn put(
        &self,
        key: &str,
        body: Bytes,
        meta: VariantMeta,
        ttl: Duration,
    ) -> Result<(), Error> {
        let sha256 = hex::encode(Sha256::digest(&body));
        let written_at = now_epoch_secs();
        let ttl_secs = ttl.as_secs();

        if body.len() <= self.single_part_ceiling {
            let record = VariantRecord::Single {
                size: body.len() as u64,
                sha256,
                written_at,
                ttl_secs,
                meta,
            };
            let metadata = serde_json::to_value(&record)
                .map_err(|e| Error::unknown(format!("variant metadata: {}", e)))?;
            self.store
                .put(&Self::entry_key(key), body, Some(metadata), Some(ttl))
                .await?;
            return Ok(());
        }

        let total_size = body.len() as u64;
        let chunk_size = self.chunk_size as u64;
        let chunk_count = total_size.div_ceil(chunk_size) as u32;

        for index in 0..chunk_count {
            let start = index as u64 * chunk_size;
            let end = (start + chunk_size).min(total_size);
            let chunk = body.slice(start as usize..end as usize);

            let sidecar = serde_json::to_value(ChunkRecord {
                offset: start,
                length: end - start,
            })
            .map_err(|e| Error::unknown(format!("chunk metadata: {}", e)))?;

            self.store
                .put(
                    &Self::chunk_key(key, index),
                    chunk,
                    Some(sidecar),
                    Some(ttl),
                )
                .await?;
        }

        let record = VariantRecord::Chunked {
            total_size,
            chunk_count,
            chunk_size,
            sha256,
            written_at,
            ttl_secs,
            meta,
        };
        let metadata = serde_json::to_value(&record)
            .map_err(|e| Error::unknown(format!("variant metadata: {}", e)))?;

        // Manifest last; see ordering note above.
        self.store
            .put(&Self::entry_key(key), Bytes::new(), Some(metadata), Some(ttl))
            .await?;

        debug!(
            key,
            total_size, chunk_count, "stored chunked variant"
        );
        Ok(())
    }

    /// Fetch a variant, optionally constrained to an inclusive byte range.
    /// Integrity violations and chunk read failures degrade to a miss.
    pub async fn get(&self, key: &str, range: Option<(u64, u64)>) -> VariantRead {
        let entry = match self.store.get(&Self::entry_key(key)).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return VariantRead::Miss,
            Err(e) => {
                warn!(key, error = %e, "variant read failed");
                return VariantRead::Miss;
            }
        };

        let record: VariantRecord = match entry
            .metadata
            .as_ref()
            .and_then(|m| serde_json::from_value(m.clone()).ok())
        {
            Some(record) => record,
            None => {
                warn!(key, "variant entry has unreadable metadata");
                return VariantRead::CorruptMiss;
            }
        };

        let read = match &record {
            VariantRecord::Single {
                size,
                sha256,
                meta,
                ..
            } => self.read_single(key, &entry.value, *size, sha256, meta, range),
            VariantRecord::Chunked {
                total_size,
                chunk_count,
                chunk_size,
                sha256,
                meta,
                ..
            } => {
                self.read_chunked(
                    key,
                    *total_size,
                    *chunk_count,
                    *chunk_size,
                    sha256,
                    meta,
                    range,
                )
                .await
            }
        };

        if let VariantRead::Hit(_) = &read {
            self.maybe_refresh(key, &record);
        }

        read
    }

    fn read_single(
        &self,
        key: &str,
        body: &Bytes,
        size: u64,
        sha256: &str,
        meta: &VariantMeta,
        range: Option<(u64, u64)>,
    ) -> VariantRead {
        if body.len() as u64 != size {
            warn!(key, expected = size, actual = body.len(), "variant size mismatch");
            return VariantRead::CorruptMiss;
        }
        if hex::encode(Sha256::digest(body)) != sha256 {
            warn!(key, "variant digest mismatch");
            return VariantRead::CorruptMiss;
        }

        match clamp_range(range, size) {
            None => VariantRead::Hit(StoredVariant {
                meta: meta.clone(),
                total_size: size,
                body: body.clone(),
                range: None,
            }),
            Some(Ok((start, end))) => VariantRead::Hit(StoredVariant {
                meta: meta.clone(),
                total_size: size,
                body: body.slice(start as usize..=end as usize),
                range: Some((start, end)),
            }),
            Some(Err(())) => VariantRead::Unsatisfiable(size),
        }
    }

    async fn read_chunked(
        &self,
        key: &str,
        total_size: u64,
        chunk_count: u32,
        chunk_size: u64,
        sha256: &str,
        meta: &VariantMeta,
        range: Option<(u64, u64)>,
    ) -> VariantRead {
        let range = match clamp_range(range, total_size) {
            Some(Err(())) => return VariantRead::Unsatisfiable(total_size),
            Some(Ok(r)) => Some(r),
            None => None,
        };

        // Only the chunks overlapping the requested span are fetched.
        let (first_chunk, last_chunk) = match range {
            Some((start, end)) => (
                (start / chunk_size) as u32,
                (end / chunk_size) as u32,
            ),
            None => (0, chunk_count.saturating_sub(1)),
        };

        let mut assembled = BytesMut::new();
        for index in first_chunk..=last_chunk {
            let chunk_key = Self::chunk_key(key, index);
            let entry = match self.store.get(&chunk_key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!(key, chunk = index, "manifest references a missing chunk");
                    return VariantRead::CorruptMiss;
                }
                Err(e) => {
                    warn!(key, chunk = index, error = %e, "chunk read failed");
                    return VariantRead::CorruptMiss;
                }
            };

            let expected_len = expected_chunk_len(index, chunk_count, chunk_size, total_size);
            if entry.value.len() as u64 != expected_len {
                warn!(
                    key,
                    chunk = index,
                    expected = expected_len,
                    actual = entry.value.len(),
                    "chunk length mismatch"
                );
                return VariantRead::CorruptMiss;
            }

            assembled.extend_from_slice(&entry.value);
        }

        let assembled = assembled.freeze();

        match range {
            None => {
                if assembled.len() as u64 != total_size {
                    warn!(key, "assembled size mismatch");
                    return VariantRead::CorruptMiss;
                }
                if hex::encode(Sha256::digest(&assembled)) != sha256 {
                    warn!(key, "assembled digest mismatch");
                    return VariantRead::CorruptMiss;
                }
                VariantRead::Hit(StoredVariant {
                    meta: meta.clone(),
                    total_size,
                    body: assembled,
                    range: None,
                })
            }
            Some((start, end)) => {
                let offset = (first_chunk as u64) * chunk_size;
                let from = (start - offset) as usize;
                let to = (end - offset) as usize;
                if to >= assembled.len() {
                    warn!(key, "range slice exceeds assembled chunks");
                    return VariantRead::CorruptMiss;
                }
                VariantRead::Hit(StoredVariant {
                    meta: meta.clone(),
                    total_size,
                    body: assembled.slice(from..=to),
                    range: Some((start, end)),
                })
            }
        }
    }

    /// Kick off a background TTL extension when the entry has aged past the
    /// configured fraction of its TTL. Readers are never blocked.
    fn maybe_refresh(&self, key: &str, record: &VariantRecord) {
        let (written_at, ttl_secs) = match record {
            VariantRecord::Single {
                written_at,
                ttl_secs,
                ..
            }
            | VariantRecord::Chunked {
                written_at,
                ttl_secs,
                ..
            } => (*written_at, *ttl_secs),
        };

        if ttl_secs == 0 {
            return;
        }
        let age = now_epoch_secs().saturating_sub(written_at);
        if (age as f64) < self.refresh_age_fraction * ttl_secs as f64 {
            return;
        }

        let store = self.store.clone();
        let key = key.to_string();
        let entry_key = Self::entry_key(&key);
        let new_ttl =
            Duration::from_secs((ttl_secs as f64 * self.refresh_ttl_multiplier) as u64);
        let mut refreshed = record.clone();
        match &mut refreshed {
            VariantRecord::Single {
                written_at,
                ttl_secs,
                ..
            }
            | VariantRecord::Chunked {
                written_at,
                ttl_secs,
                ..
            } => {
                *written_at = now_epoch_secs();
                *ttl_secs = new_ttl.as_secs();
            }
        }
        let chunk_count = match &refreshed {
            VariantRecord::Chunked { chunk_count, .. } => *chunk_count,
            _ => 0,
        };

        tokio::spawn(async move {
            // Re-write chunks first with the extended TTL, manifest last,
            // preserving the write-order invariant.
            for index in 0..chunk_count {
                let chunk_key = format!("{}:chunk:{}", entry_key, index);
                match store.get(&chunk_key).await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = store
                            .put(&chunk_key, chunk.value, chunk.metadata, Some(new_ttl))
                            .await
                        {
                            debug!(key = %key, chunk = index, error = %e, "ttl refresh aborted");
                            return;
                        }
                    }
                    _ => return,
                }
            }

            let Ok(Some(entry)) = store.get(&entry_key).await else {
                return;
            };
            let metadata = serde_json::to_value(&refreshed).ok();
            if let Err(e) = store.put(&entry_key, entry.value, metadata, Some(new_ttl)).await {
                debug!(key = %key, error = %e, "ttl refresh failed");
            } else {
                debug!(key = %key, ttl = new_ttl.as_secs(), "variant ttl refreshed");
            }
        });
    }

    /// Remove a variant and any chunks its manifest references.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        if let Ok(Some(entry)) = self.store.get(&Self::entry_key(key)).await {
            if let Some(VariantRecord::Chunked { chunk_count, .. }) = entry
                .metadata
                .as_ref()
                .and_then(|m| serde_json::from_value(m.clone()).ok())
            {
                for index in 0..chunk_count {
                    self.store.delete(&Self::chunk_key(key, index)).await?;
                }
            }
        }
        self.store.delete(&Self::entry_key(key)).await
    }
}

/// Clamp an inclusive range against the body size. `None` means "whole body";
/// `Some(Err(()))` means unsatisfiable.
fn clamp_range(range: Option<(u64, u64)>, size: u64) -> Option<Result<(u64, u64), ()>> {
    let (start, end) = range?;
    if size == 0 || start >= size || start > end {
        return Some(Err(()));
    }
    Some(Ok((start, end.min(size - 1))))
}

fn expected_chunk_len(index: u32, chunk_count: u32, chunk_size: u64, total_size: u64) -> u64 {
    if index + 1 == chunk_count {
        total_size - (index as u64) * chunk_size
    } else {
        chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn store() -> (Arc<MemoryKvStore>, VariantStore) {
        let kv = Arc::new(MemoryKvStore::default());
        let variants = VariantStore::new(kv.clone() as Arc<dyn KvStore>).with_geometry(64, 16);
        (kv, variants)
    }

    fn meta() -> VariantMeta {
        VariantMeta {
            content_type: "video/mp4".into(),
            ..Default::default()
        }
    }

    fn body(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    #[tokio::test]
    async fn round_trip_preserves_bytes_and_metadata() {
        let (_, variants) = store();
        let payload = body(1000);

        variants
            .put("k1", payload.clone(), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        let read = variants.get("k1", None).await.into_option().unwrap();
        assert_eq!(read.body, payload);
        assert_eq!(read.total_size, 1000);
        assert_eq!(read.meta.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn ceiling_boundary_selects_layout() {
        let (kv, variants) = store();

        variants
            .put("exact", body(64), meta(), Duration::from_secs(60))
            .await
            .unwrap();
        // exactly at the ceiling: single-part, no chunk keys
        assert!(kv.get("variant:exact:chunk:0").await.unwrap().is_none());

        variants
            .put("over", body(65), meta(), Duration::from_secs(60))
            .await
            .unwrap();
        // one byte over: chunked with 16-byte chunks
        assert!(kv.get("variant:over:chunk:0").await.unwrap().is_some());
        assert!(kv.get("variant:over:chunk:4").await.unwrap().is_some());
        assert!(kv.get("variant:over:chunk:5").await.unwrap().is_none());

        let read = variants.get("over", None).await.into_option().unwrap();
        assert_eq!(read.body, body(65));
    }

    #[tokio::test]
    async fn range_reads_touch_only_overlapping_chunks() {
        let (kv, variants) = store();
        let payload = body(100);
        variants
            .put("r", payload.clone(), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        // drop a chunk outside the requested span; the read must still succeed
        kv.delete("variant:r:chunk:0").await.unwrap();

        let read = variants.get("r", Some((40, 79))).await.into_option().unwrap();
        assert_eq!(read.range, Some((40, 79)));
        assert_eq!(&read.body[..], &payload[40..=79]);
        assert_eq!(read.total_size, 100);
    }

    #[tokio::test]
    async fn open_ended_range_is_clamped() {
        let (_, variants) = store();
        let payload = body(50);
        variants
            .put("c", payload.clone(), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        let read = variants
            .get("c", Some((10, u64::MAX)))
            .await
            .into_option()
            .unwrap();
        assert_eq!(read.range, Some((10, 49)));
        assert_eq!(&read.body[..], &payload[10..]);
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_a_miss() {
        let (_, variants) = store();
        variants
            .put("u", body(50), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(matches!(
            variants.get("u", Some((900, 999))).await,
            VariantRead::Unsatisfiable(50)
        ));
    }

    #[tokio::test]
    async fn missing_chunk_degrades_to_corrupt_miss() {
        let (kv, variants) = store();
        variants
            .put("m", body(100), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        kv.delete("variant:m:chunk:2").await.unwrap();

        assert!(matches!(
            variants.get("m", None).await,
            VariantRead::CorruptMiss
        ));
    }

    #[tokio::test]
    async fn truncated_chunk_degrades_to_corrupt_miss() {
        let (kv, variants) = store();
        variants
            .put("t", body(100), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        // overwrite a middle chunk with a short body
        kv.put("variant:t:chunk:1", body(3), None, None)
            .await
            .unwrap();

        assert!(matches!(
            variants.get("t", None).await,
            VariantRead::CorruptMiss
        ));
    }

    #[tokio::test]
    async fn corrupted_single_part_degrades_to_corrupt_miss() {
        let (kv, variants) = store();
        variants
            .put("s", body(32), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        // flip the stored bytes while keeping the metadata
        let entry = kv.get("variant:s").await.unwrap().unwrap();
        kv.put("variant:s", body(31), entry.metadata, None)
            .await
            .unwrap();

        assert!(matches!(
            variants.get("s", None).await,
            VariantRead::CorruptMiss
        ));
    }

    #[tokio::test]
    async fn delete_removes_manifest_and_chunks() {
        let (kv, variants) = store();
        variants
            .put("d", body(100), meta(), Duration::from_secs(60))
            .await
            .unwrap();

        variants.delete("d").await.unwrap();
        assert!(kv.get("variant:d").await.unwrap().is_none());
        assert!(kv.get("variant:d:chunk:0").await.unwrap().is_none());
    }
}
