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

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::digest::ValueDigest;
use crate::errors::Result;
use crate::store::{SharedStore, StoreId};

/// The sort key of a node entry.
///
/// Indexed sequences (blobs) key their children by item count; ordered
/// sequences (maps) key them by the maximal map key below the child. The
/// two kinds never mix within one tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderedKey {
    /// Number of leaf items covered by the keyed subtree.
    Index(u64),
    /// The greatest map key reachable through the keyed subtree.
    Value(Vec<u8>),
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (OrderedKey::Index(a), OrderedKey::Index(b)) => a.cmp(b),
            (OrderedKey::Value(a), OrderedKey::Value(b)) => a.cmp(b),
            (OrderedKey::Index(_), OrderedKey::Value(_)) => Ordering::Less,
            (OrderedKey::Value(_), OrderedKey::Index(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One key/value pair stored in a map leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// An internal-node entry: a child reference, the child's ordered key, and
/// the number of leaf items below it. Leaf counts are summed along a node
/// to resolve positions during cursor descent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTuple<const N: usize> {
    pub child: ValueDigest<N>,
    pub key: OrderedKey,
    pub num_leaves: u64,
}

/// A persisted tree node.
///
/// Leaves sit at level 0 and carry raw items; internal nodes carry
/// meta-tuples referencing the level below. Nodes are immutable once
/// written and referenced by content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceNode<const N: usize> {
    BlobLeaf(Vec<u8>),
    MapLeaf(Vec<MapEntry>),
    Meta {
        level: u64,
        tuples: Vec<MetaTuple<N>>,
    },
}

impl<const N: usize> SequenceNode<N> {
    pub fn level(&self) -> u64 {
        match self {
            SequenceNode::BlobLeaf(_) | SequenceNode::MapLeaf(_) => 0,
            SequenceNode::Meta { level, .. } => *level,
        }
    }

    /// Number of items held directly in this node.
    pub fn len(&self) -> usize {
        match self {
            SequenceNode::BlobLeaf(data) => data.len(),
            SequenceNode::MapLeaf(entries) => entries.len(),
            SequenceNode::Meta { tuples, .. } => tuples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_meta(&self) -> bool {
        matches!(self, SequenceNode::Meta { .. })
    }

    /// Total number of level-0 items reachable through this node.
    pub fn num_leaves(&self) -> u64 {
        match self {
            SequenceNode::BlobLeaf(data) => data.len() as u64,
            SequenceNode::MapLeaf(entries) => entries.len() as u64,
            SequenceNode::Meta { tuples, .. } => tuples.iter().map(|t| t.num_leaves).sum(),
        }
    }
}

/// A handle to a committed immutable tree: the root node, its content
/// reference, and the store that resolves child references.
#[derive(Debug, Clone)]
pub struct Sequence<const N: usize> {
    store: SharedStore<N>,
    root: Arc<SequenceNode<N>>,
    root_ref: ValueDigest<N>,
}

impl<const N: usize> Sequence<N> {
    /// Persists `root` and wraps it as a sequence handle.
    pub fn new(store: SharedStore<N>, root: SequenceNode<N>) -> Result<Self> {
        let root_ref = store.write_value(&root)?;
        Ok(Sequence {
            store,
            root: Arc::new(root),
            root_ref,
        })
    }

    /// Wraps an already-persisted root node.
    pub(crate) fn from_parts(
        store: SharedStore<N>,
        root: Arc<SequenceNode<N>>,
        root_ref: ValueDigest<N>,
    ) -> Self {
        Sequence {
            store,
            root,
            root_ref,
        }
    }

    pub fn level(&self) -> u64 {
        self.root.level()
    }

    pub fn num_leaves(&self) -> u64 {
        self.root.num_leaves()
    }

    pub fn root(&self) -> Arc<SequenceNode<N>> {
        Arc::clone(&self.root)
    }

    pub fn root_ref(&self) -> ValueDigest<N> {
        self.root_ref
    }

    pub fn store(&self) -> SharedStore<N> {
        Arc::clone(&self.store)
    }

    pub fn store_id(&self) -> StoreId {
        self.store.id()
    }
}
