use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CairnError, Result};
use crate::id::{BlobType, Id};
use crate::pack::PackedBlob;

/// Physical location of one blob: which pack, where inside it, and how long
/// the ciphertext is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLocation {
    pub pack: Id,
    pub blob_type: BlobType,
    pub offset: u64,
    pub length: u32,
    pub uncompressed_length: Option<u32>,
}

/// One in-memory index: a set of pack records, each listing the blobs the
/// pack contains.
///
/// State machine: `Open` (accepts entries) -> `Finalized` (immutable,
/// awaiting upload) -> `Saved` (has an id, appears in the master index).
#[derive(Debug, Default)]
pub struct Index {
    packs: HashMap<Id, Vec<PackedBlob>>,
    lookup: HashMap<(BlobType, Id), BlobLocation>,
    supersedes: Vec<Id>,
    finalized: bool,
    id: Option<Id>,
}

/// Persisted form: sealed JSON under the `index` file type.
#[derive(Serialize, Deserialize)]
struct IndexFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    supersedes: Vec<Id>,
    packs: Vec<IndexPackFile>,
}

#[derive(Serialize, Deserialize)]
struct IndexPackFile {
    id: Id,
    blobs: Vec<IndexBlobFile>,
}

#[derive(Serialize, Deserialize)]
struct IndexBlobFile {
    id: Id,
    #[serde(rename = "type")]
    blob_type: BlobType,
    offset: u64,
    length: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uncompressed_length: Option<u32>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pack and its blobs. Only open indexes accept new entries.
    pub fn store(&mut self, pack: Id, blobs: Vec<PackedBlob>) -> Result<()> {
        if self.finalized {
            return Err(CairnError::Other(
                "store called on a finalized index".into(),
            ));
        }
        for blob in &blobs {
            self.lookup.insert(
                (blob.blob_type, blob.id),
                BlobLocation {
                    pack,
                    blob_type: blob.blob_type,
                    offset: blob.offset,
                    length: blob.length,
                    uncompressed_length: blob.uncompressed_length,
                },
            );
        }
        self.packs.entry(pack).or_default().extend(blobs);
        Ok(())
    }

    pub fn lookup(&self, blob_type: BlobType, id: &Id) -> Option<BlobLocation> {
        self.lookup.get(&(blob_type, *id)).copied()
    }

    pub fn has(&self, blob_type: BlobType, id: &Id) -> bool {
        self.lookup.contains_key(&(blob_type, *id))
    }

    /// Number of blobs.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    pub fn pack_ids(&self) -> impl Iterator<Item = &Id> {
        self.packs.keys()
    }

    /// Make this index immutable. Further `store` calls fail.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn id(&self) -> Option<Id> {
        self.id
    }

    /// Attach the storage id after the index file was uploaded.
    pub fn set_id(&mut self, id: Id) -> Result<()> {
        if !self.finalized {
            return Err(CairnError::Other("set_id on an open index".into()));
        }
        if self.id.is_some() {
            return Err(CairnError::Other("index id already set".into()));
        }
        self.id = Some(id);
        Ok(())
    }

    /// Ids of index files this one replaces (carried through from decoded
    /// files; produced by repack flows).
    pub fn supersedes(&self) -> &[Id] {
        &self.supersedes
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut packs: Vec<IndexPackFile> = self
            .packs
            .iter()
            .map(|(pack_id, blobs)| IndexPackFile {
                id: *pack_id,
                blobs: blobs
                    .iter()
                    .map(|b| IndexBlobFile {
                        id: b.id,
                        blob_type: b.blob_type,
                        offset: b.offset,
                        length: b.length,
                        uncompressed_length: b.uncompressed_length,
                    })
                    .collect(),
            })
            .collect();
        // Deterministic output independent of hash-map iteration order.
        packs.sort_by_key(|p| p.id);
        Ok(serde_json::to_vec(&IndexFile {
            supersedes: self.supersedes.clone(),
            packs,
        })?)
    }

    /// Parse the JSON wire form. Decoded indexes are finalized: they mirror
    /// persisted state and never accept new entries.
    pub fn decode(bytes: &[u8]) -> Result<Index> {
        let file: IndexFile = serde_json::from_slice(bytes)?;
        let mut index = Index::new();
        for pack in file.packs {
            let blobs: Vec<PackedBlob> = pack
                .blobs
                .into_iter()
                .map(|b| PackedBlob {
                    blob_type: b.blob_type,
                    id: b.id,
                    offset: b.offset,
                    length: b.length,
                    uncompressed_length: b.uncompressed_length,
                })
                .collect();
            index.store(pack.id, blobs)?;
        }
        index.supersedes = file.supersedes;
        index.finalize();
        Ok(index)
    }
}

/// Process-wide union of all loaded indexes plus the one currently being
/// built.
///
/// Reader-writer discipline: many concurrent lookups, serialized mutation.
/// Writers (pack upload threads, the index loader) take the write lock
/// briefly; nothing holds it across I/O.
#[derive(Debug, Default)]
pub struct MasterIndex {
    inner: RwLock<MasterInner>,
}

#[derive(Debug, Default)]
struct MasterInner {
    /// Finalized (and possibly saved) indexes.
    indexes: Vec<Index>,
    /// The open index receiving entries from the current session.
    open: Index,
    /// Blobs sitting in not-yet-uploaded packers. Makes concurrent and
    /// repeated SaveBlob calls for the same content upload it at most once.
    pending: HashSet<(BlobType, Id)>,
}

impl MasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, blob_type: BlobType, id: &Id) -> Option<BlobLocation> {
        let inner = self.inner.read().unwrap();
        inner
            .open
            .lookup(blob_type, id)
            .or_else(|| inner.indexes.iter().find_map(|idx| idx.lookup(blob_type, id)))
    }

    /// Whether the blob is fully indexed (pending blobs don't count).
    pub fn has(&self, blob_type: BlobType, id: &Id) -> bool {
        self.lookup(blob_type, id).is_some()
    }

    /// Claim a blob for writing. Returns false when the blob is already
    /// indexed or another writer claimed it first; the caller must not
    /// store it again.
    pub fn add_pending(&self, blob_type: BlobType, id: &Id) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.open.has(blob_type, id)
            || inner.indexes.iter().any(|idx| idx.has(blob_type, id))
        {
            return false;
        }
        inner.pending.insert((blob_type, *id))
    }

    /// Release a claim taken with [`add_pending`](Self::add_pending) whose
    /// write failed, so the content can be stored by a later call.
    pub fn remove_pending(&self, blob_type: BlobType, id: &Id) {
        self.inner.write().unwrap().pending.remove(&(blob_type, *id));
    }

    /// Record an uploaded pack in the open index and clear its blobs from the
    /// pending set.
    pub fn store_pack(&self, pack: Id, blobs: Vec<PackedBlob>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for blob in &blobs {
            inner.pending.remove(&(blob.blob_type, blob.id));
        }
        inner.open.store(pack, blobs)
    }

    /// Add a finalized index (typically decoded from storage).
    pub fn insert(&self, index: Index) -> Result<()> {
        if !index.is_finalized() {
            return Err(CairnError::Other(
                "only finalized indexes can be inserted into the master index".into(),
            ));
        }
        self.inner.write().unwrap().indexes.push(index);
        Ok(())
    }

    /// Collapse all finalized indexes into one. A pack appearing in multiple
    /// index files is kept once.
    pub fn merge_final_indexes(&self) {
        let mut inner = self.inner.write().unwrap();
        let sources = std::mem::take(&mut inner.indexes);
        if sources.len() <= 1 {
            inner.indexes = sources;
            return;
        }

        let before: usize = sources.iter().map(Index::pack_count).sum();
        let mut merged = Index::new();
        for source in sources {
            for (pack_id, blobs) in source.packs {
                if merged.packs.contains_key(&pack_id) {
                    continue;
                }
                // Re-storing through the public path keeps lookup consistent.
                merged
                    .store(pack_id, blobs)
                    .expect("merged index is still open");
            }
        }
        merged.finalize();
        debug!(
            packs_before = before,
            packs_after = merged.pack_count(),
            "merged final indexes"
        );
        inner.indexes = vec![merged];
    }

    /// Snapshot the open index into an immutable value for upload, replacing
    /// it with a fresh one. Returns `None` when the open index is empty.
    pub fn finalize_open(&self) -> Option<Index> {
        let mut inner = self.inner.write().unwrap();
        if inner.open.is_empty() {
            return None;
        }
        let mut snapshot = std::mem::take(&mut inner.open);
        snapshot.finalize();
        Some(snapshot)
    }

    /// Total number of distinct packs across all indexes.
    pub fn pack_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let mut packs: HashSet<Id> = inner.open.packs.keys().copied().collect();
        for index in &inner.indexes {
            packs.extend(index.packs.keys().copied());
        }
        packs.len()
    }

    /// Total number of indexed blobs.
    pub fn blob_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let mut seen: HashSet<(BlobType, Id)> =
            inner.open.lookup.keys().copied().collect();
        for index in &inner.indexes {
            seen.extend(index.lookup.keys().copied());
        }
        seen.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.read().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(n: u8, offset: u64, length: u32) -> PackedBlob {
        PackedBlob {
            blob_type: BlobType::Data,
            id: Id::hash(&[n]),
            offset,
            length,
            uncompressed_length: None,
        }
    }

    #[test]
    fn store_and_lookup() {
        let mut index = Index::new();
        let pack = Id::hash(b"pack");
        index.store(pack, vec![blob(1, 0, 100), blob(2, 100, 50)]).unwrap();

        let loc = index.lookup(BlobType::Data, &Id::hash(&[2])).unwrap();
        assert_eq!(loc.pack, pack);
        assert_eq!(loc.offset, 100);
        assert_eq!(loc.length, 50);
        assert!(!index.has(BlobType::Tree, &Id::hash(&[2])));
    }

    #[test]
    fn finalized_index_rejects_entries() {
        let mut index = Index::new();
        index.store(Id::hash(b"p"), vec![blob(1, 0, 10)]).unwrap();
        index.finalize();
        assert!(index.store(Id::hash(b"q"), vec![blob(2, 0, 10)]).is_err());
    }

    #[test]
    fn set_id_requires_finalized() {
        let mut index = Index::new();
        assert!(index.set_id(Id::random()).is_err());
        index.finalize();
        let id = Id::random();
        index.set_id(id).unwrap();
        assert_eq!(index.id(), Some(id));
        assert!(index.set_id(Id::random()).is_err());
    }

    #[test]
    fn encode_decode_roundtrip_preserves_everything() {
        let mut index = Index::new();
        let pack_a = Id::hash(b"pack a");
        let pack_b = Id::hash(b"pack b");
        index.store(pack_a, vec![blob(1, 0, 100), blob(2, 100, 64)]).unwrap();
        index
            .store(
                pack_b,
                vec![PackedBlob {
                    blob_type: BlobType::Tree,
                    id: Id::hash(&[3]),
                    offset: 0,
                    length: 80,
                    uncompressed_length: Some(200),
                }],
            )
            .unwrap();

        let decoded = Index::decode(&index.encode().unwrap()).unwrap();
        assert!(decoded.is_finalized());
        assert_eq!(decoded.len(), index.len());
        assert_eq!(decoded.pack_count(), index.pack_count());
        for (key, loc) in &index.lookup {
            assert_eq!(decoded.lookup.get(key), Some(loc));
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let mut index = Index::new();
        for n in 0..20u8 {
            index.store(Id::hash(&[n, n]), vec![blob(n, 0, 10)]).unwrap();
        }
        assert_eq!(index.encode().unwrap(), index.encode().unwrap());
    }

    #[test]
    fn master_merge_collapses_duplicate_packs() {
        let master = MasterIndex::new();

        let mut a = Index::new();
        a.store(Id::hash(b"shared"), vec![blob(1, 0, 10)]).unwrap();
        a.store(Id::hash(b"only a"), vec![blob(2, 0, 10)]).unwrap();
        a.finalize();

        let mut b = Index::new();
        b.store(Id::hash(b"shared"), vec![blob(1, 0, 10)]).unwrap();
        b.store(Id::hash(b"only b"), vec![blob(3, 0, 10)]).unwrap();
        b.finalize();

        master.insert(a).unwrap();
        master.insert(b).unwrap();
        assert_eq!(master.pack_count(), 3);

        master.merge_final_indexes();
        assert_eq!(master.pack_count(), 3);
        assert!(master.has(BlobType::Data, &Id::hash(&[2])));
        assert!(master.has(BlobType::Data, &Id::hash(&[3])));
    }

    #[test]
    fn master_rejects_open_indexes() {
        let master = MasterIndex::new();
        assert!(master.insert(Index::new()).is_err());
    }

    #[test]
    fn pending_gate_admits_each_blob_once() {
        let master = MasterIndex::new();
        let id = Id::hash(b"blob");
        assert!(master.add_pending(BlobType::Data, &id));
        assert!(!master.add_pending(BlobType::Data, &id));
        // The same content as a tree blob is a different entry.
        assert!(master.add_pending(BlobType::Tree, &id));

        master
            .store_pack(Id::hash(b"pack"), vec![PackedBlob {
                blob_type: BlobType::Data,
                id,
                offset: 0,
                length: 40,
                uncompressed_length: None,
            }])
            .unwrap();
        assert_eq!(master.pending_count(), 1); // the tree entry remains
        assert!(master.has(BlobType::Data, &id));
        // Once indexed, the blob can't be claimed again.
        assert!(!master.add_pending(BlobType::Data, &id));
    }

    #[test]
    fn finalize_open_snapshots_and_replaces() {
        let master = MasterIndex::new();
        assert!(master.finalize_open().is_none());

        master.store_pack(Id::hash(b"p"), vec![blob(1, 0, 10)]).unwrap();
        let snapshot = master.finalize_open().expect("open index had entries");
        assert!(snapshot.is_finalized());
        assert_eq!(snapshot.len(), 1);

        // The blob is gone from the master until the snapshot is re-inserted.
        assert!(!master.has(BlobType::Data, &Id::hash(&[1])));
        master.insert(snapshot).unwrap();
        assert!(master.has(BlobType::Data, &Id::hash(&[1])));
    }
}
