use crate::base_types::Txg;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A transaction assigned to a txg. The allocator never creates these on its
/// own behalf; the syncing context hands one in and commits it atomically.
#[derive(Debug, Copy, Clone)]
pub struct Tx {
    pub txg: Txg,
    /// Sync pass within the txg, starting at 1.
    pub sync_pass: u32,
}

impl Tx {
    pub fn assigned(txg: Txg, sync_pass: u32) -> Tx {
        assert!(sync_pass >= 1);
        Tx { txg, sync_pass }
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct ChunkHeader {
    payload_size: u64,
    checksum: u64,
}

/// Stand-in for the meta object store: a set of append-only byte logs
/// addressed by object number. Every append is framed as a checksummed
/// chunk so that the load path has a real failure mode.
pub struct MetaObjectStore {
    state: Mutex<MosState>,
}

struct MosState {
    objects: HashMap<u64, Vec<u8>>,
    next_object: u64,
}

impl Default for MetaObjectStore {
    fn default() -> Self {
        MetaObjectStore::new()
    }
}

impl MetaObjectStore {
    pub fn new() -> MetaObjectStore {
        MetaObjectStore {
            state: Mutex::new(MosState {
                objects: HashMap::new(),
                // object 0 means "no object" to callers
                next_object: 1,
            }),
        }
    }

    pub fn create_object(&self, _tx: &Tx) -> u64 {
        let mut state = self.state.lock();
        let object = state.next_object;
        state.next_object += 1;
        state.objects.insert(object, Vec::new());
        object
    }

    pub fn object_exists(&self, object: u64) -> bool {
        self.state.lock().objects.contains_key(&object)
    }

    /// Raw byte length of the object's log.
    pub fn object_len(&self, object: u64) -> u64 {
        self.state.lock().objects.get(&object).map_or(0, |v| v.len() as u64)
    }

    /// Append one checksummed chunk holding `entries`.
    pub fn append_chunk<T: Serialize>(&self, object: u64, entries: &[T], _tx: &Tx) {
        let payload = bincode::serialize(entries).unwrap();
        let header = ChunkHeader {
            payload_size: payload.len() as u64,
            checksum: seahash::hash(&payload),
        };
        let mut state = self.state.lock();
        let log = state.objects.get_mut(&object).unwrap();
        log.extend(bincode::serialize(&header).unwrap());
        log.extend(payload);
    }

    /// Append raw bytes. This is the primitive `append_chunk` builds on;
    /// it is also how tests model a torn or corrupted log.
    pub fn append_raw(&self, object: u64, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.objects.get_mut(&object).unwrap().extend_from_slice(bytes);
    }

    pub fn truncate_object(&self, object: u64, _tx: &Tx) {
        let mut state = self.state.lock();
        state.objects.get_mut(&object).unwrap().clear();
    }

    pub fn delete_object(&self, object: u64, _tx: &Tx) {
        self.state.lock().objects.remove(&object);
    }

    /// Decode every chunk in order and return the concatenated entries.
    // XXX decode chunk by chunk instead of collecting the whole log?
    pub fn read_entries<T: DeserializeOwned>(&self, object: u64) -> Result<Vec<T>> {
        let state = self.state.lock();
        let log = state
            .objects
            .get(&object)
            .ok_or_else(|| anyhow!("object {} does not exist", object))?;

        let header_size = bincode::serialized_size(&ChunkHeader {
            payload_size: 0,
            checksum: 0,
        })
        .unwrap() as usize;

        let mut entries = Vec::new();
        let mut consumed = 0;
        while consumed < log.len() {
            let buf = &log[consumed..];
            if buf.len() < header_size {
                return Err(anyhow!("truncated chunk header in object {}", object));
            }
            let header: ChunkHeader = bincode::deserialize(&buf[..header_size])
                .context(format!("chunk header at offset {}", consumed))?;
            let payload_size = header.payload_size as usize;
            if buf.len() - header_size < payload_size {
                return Err(anyhow!(
                    "chunk at offset {} claims {} bytes, {} remain",
                    consumed,
                    payload_size,
                    buf.len() - header_size
                ));
            }
            let payload = &buf[header_size..header_size + payload_size];
            let actual = seahash::hash(payload);
            if actual != header.checksum {
                return Err(anyhow!(
                    "checksum mismatch in object {} at offset {}: expected {:x}, got {:x}",
                    object,
                    consumed,
                    header.checksum,
                    actual
                ));
            }
            let mut chunk: Vec<T> = bincode::deserialize(payload)
                .context(format!("chunk payload at offset {}", consumed))?;
            entries.append(&mut chunk);
            consumed += header_size + payload_size;
        }
        Ok(entries)
    }
}
