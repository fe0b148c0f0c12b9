/*
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Format;
use crate::digest::ValueDigest;
use crate::errors::Result;
use crate::node::SequenceNode;

/// Identity of a value store instance.
///
/// Sequences may only be spliced together when their stores share an id;
/// meta-tuple references are meaningless across stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(u64);

impl StoreId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        StoreId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Content-addressed persistence for sequence nodes.
///
/// Implementations must support concurrent readers and writers; blob
/// construction persists leaf chunks from worker threads. Writes are
/// idempotent: the same node always maps to the same reference.
pub trait ValueStore<const N: usize>: Send + Sync + std::fmt::Debug {
    /// Persists an immutable node and returns its content reference.
    fn write_value(&self, node: &SequenceNode<N>) -> Result<ValueDigest<N>>;

    /// Resolves a reference written earlier. Used by cursor navigation.
    fn read_value(&self, r: &ValueDigest<N>) -> Result<Arc<SequenceNode<N>>>;

    /// The serialization format governing chunking and key comparison for
    /// every sequence in this store.
    fn format(&self) -> &Format;

    fn id(&self) -> StoreId;
}

pub type SharedStore<const N: usize> = Arc<dyn ValueStore<N>>;

fn encode<const N: usize>(node: &SequenceNode<N>) -> Result<(Vec<u8>, ValueDigest<N>)> {
    let encoded = bincode::serialize(node)?;
    let digest = ValueDigest::new(&encoded);
    Ok((encoded, digest))
}

fn missing_value<const N: usize>(r: &ValueDigest<N>) -> crate::errors::ProllyError {
    io::Error::new(io::ErrorKind::NotFound, format!("no value for ref {r}")).into()
}

/// A store backed by an in-memory map, the default for tests and for
/// ephemeral sequence construction.
#[derive(Debug)]
pub struct InMemoryStore<const N: usize> {
    id: StoreId,
    format: Format,
    nodes: Mutex<HashMap<ValueDigest<N>, Arc<SequenceNode<N>>>>,
}

impl<const N: usize> InMemoryStore<N> {
    pub fn new(format: Format) -> Self {
        InMemoryStore {
            id: StoreId::next(),
            format,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Convenience constructor returning the store behind the trait object
    /// the engine passes around.
    pub fn shared(format: Format) -> SharedStore<N> {
        Arc::new(Self::new(format))
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> ValueStore<N> for InMemoryStore<N> {
    fn write_value(&self, node: &SequenceNode<N>) -> Result<ValueDigest<N>> {
        let (_, digest) = encode(node)?;
        let mut nodes = self.nodes.lock().expect("store mutex poisoned");
        nodes
            .entry(digest)
            .or_insert_with(|| Arc::new(node.clone()));
        tracing::trace!(r = %digest, level = node.level(), items = node.len(), "wrote value");
        Ok(digest)
    }

    fn read_value(&self, r: &ValueDigest<N>) -> Result<Arc<SequenceNode<N>>> {
        let nodes = self.nodes.lock().expect("store mutex poisoned");
        nodes.get(r).cloned().ok_or_else(|| missing_value(r))
    }

    fn format(&self) -> &Format {
        &self.format
    }

    fn id(&self) -> StoreId {
        self.id
    }
}

/// A store that keeps each node in its own file named by the hex of its
/// reference. Nodes are bincode-encoded on disk.
#[derive(Debug)]
pub struct FileStore<const N: usize> {
    id: StoreId,
    format: Format,
    dir: PathBuf,
}

impl<const N: usize> FileStore<N> {
    pub fn new(dir: PathBuf, format: Format) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(FileStore {
            id: StoreId::next(),
            format,
            dir,
        })
    }

    fn value_path(&self, r: &ValueDigest<N>) -> PathBuf {
        self.dir.join(hex::encode(r.as_bytes()))
    }
}

impl<const N: usize> ValueStore<N> for FileStore<N> {
    fn write_value(&self, node: &SequenceNode<N>) -> Result<ValueDigest<N>> {
        let (encoded, digest) = encode(node)?;
        let path = self.value_path(&digest);
        if !path.exists() {
            fs::write(path, encoded)?;
        }
        tracing::trace!(r = %digest, level = node.level(), items = node.len(), "wrote value");
        Ok(digest)
    }

    fn read_value(&self, r: &ValueDigest<N>) -> Result<Arc<SequenceNode<N>>> {
        let bytes = match fs::read(self.value_path(r)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(missing_value(r)),
            Err(e) => return Err(e.into()),
        };
        let node: SequenceNode<N> = bincode::deserialize(&bytes)?;
        Ok(Arc::new(node))
    }

    fn format(&self) -> &Format {
        &self.format
    }

    fn id(&self) -> StoreId {
        self.id
    }
}
