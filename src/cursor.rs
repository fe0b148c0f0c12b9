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

use std::sync::Arc;

use crate::chunker::SequenceItem;
use crate::errors::{ProllyError, Result};
use crate::node::{OrderedKey, SequenceNode};
use crate::store::SharedStore;

/// An ephemeral position within a committed tree.
///
/// A cursor at level L holds the node it points into, the index of the
/// current item, and a cursor into the parent level. Moves that leave the
/// current node advance or retreat the parent and reload the child from
/// the parent's new position. Cursors reference but never own or mutate
/// tree nodes; any number may exist over the same tree concurrently.
///
/// The index ranges over `-1..=len`: `-1` is the before-start sentinel and
/// `len` the one-past-end sentinel. Both sentinels are invalid to read
/// from but are well-defined resume points for chunking.
#[derive(Debug, Clone)]
pub struct SequenceCursor<const N: usize> {
    parent: Option<Box<SequenceCursor<N>>>,
    store: SharedStore<N>,
    node: Arc<SequenceNode<N>>,
    idx: isize,
}

impl<const N: usize> SequenceCursor<N> {
    fn new(
        parent: Option<Box<SequenceCursor<N>>>,
        store: SharedStore<N>,
        node: Arc<SequenceNode<N>>,
        idx: isize,
    ) -> Self {
        SequenceCursor {
            parent,
            store,
            node,
            idx,
        }
    }

    pub fn level(&self) -> u64 {
        self.node.level()
    }

    fn len(&self) -> isize {
        self.node.len() as isize
    }

    /// True when the cursor points at a concrete item.
    pub fn valid(&self) -> bool {
        self.idx >= 0 && self.idx < self.len()
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<&SequenceCursor<N>> {
        self.parent.as_deref()
    }

    pub(crate) fn parent_cloned(&self) -> Option<SequenceCursor<N>> {
        self.parent.as_deref().cloned()
    }

    pub(crate) fn node(&self) -> &SequenceNode<N> {
        &self.node
    }

    /// Index of the current item within its chunk. Chunks and nodes
    /// coincide, so this is simply the node-local index.
    pub(crate) fn index_in_chunk(&self) -> isize {
        self.idx
    }

    pub(crate) fn at_last_item(&self) -> bool {
        self.len() > 0 && self.idx == self.len() - 1
    }

    /// The item under the cursor.
    pub fn current(&self) -> Result<SequenceItem<N>> {
        if !self.valid() {
            return Err(ProllyError::InvalidCursor);
        }
        let idx = self.idx as usize;
        Ok(match self.node.as_ref() {
            SequenceNode::BlobLeaf(data) => SequenceItem::Byte(data[idx]),
            SequenceNode::MapLeaf(entries) => SequenceItem::Entry(entries[idx].clone()),
            SequenceNode::Meta { tuples, .. } => SequenceItem::Meta(tuples[idx].clone()),
        })
    }

    /// Reloads this cursor's node from the parent's current meta-tuple.
    fn sync(&mut self) -> Result<()> {
        let parent = self.parent.as_ref().ok_or(ProllyError::InvalidCursor)?;
        let item = parent.current()?;
        let SequenceItem::Meta(mt) = item else {
            return Err(ProllyError::InvalidCursor);
        };
        self.node = self.store.read_value(&mt.child)?;
        Ok(())
    }

    /// Moves one item forward, walking into the next chunk through the
    /// parent when the current one is exhausted. Returns whether the
    /// cursor now points at a concrete item; when it does not, the cursor
    /// rests at the one-past-end sentinel.
    pub fn advance(&mut self) -> Result<bool> {
        self.advance_maybe_allow_past_end(true)
    }

    pub(crate) fn advance_maybe_allow_past_end(&mut self, allow_past_end: bool) -> Result<bool> {
        if self.idx + 1 < self.len() {
            self.idx += 1;
            return Ok(true);
        }
        if self.idx == self.len() {
            // Already past the end.
            return Ok(false);
        }
        if let Some(parent) = self.parent.as_mut() {
            if parent.advance_maybe_allow_past_end(false)? {
                self.sync()?;
                self.idx = 0;
                return Ok(true);
            }
        }
        if allow_past_end {
            self.idx += 1;
        }
        Ok(false)
    }

    /// Moves one item backward, the mirror of [`advance`](Self::advance).
    pub fn retreat(&mut self) -> Result<bool> {
        self.retreat_maybe_allow_before_start(true)
    }

    pub(crate) fn retreat_maybe_allow_before_start(
        &mut self,
        allow_before_start: bool,
    ) -> Result<bool> {
        if self.idx > 0 {
            self.idx -= 1;
            return Ok(true);
        }
        if self.idx == -1 {
            return Ok(false);
        }
        if let Some(parent) = self.parent.as_mut() {
            if parent.retreat_maybe_allow_before_start(false)? {
                self.sync()?;
                self.idx = self.len() - 1;
                return Ok(true);
            }
        }
        if allow_before_start {
            self.idx -= 1;
        }
        Ok(false)
    }

    /// Jumps from anywhere in the current chunk to the first item of the
    /// next chunk. Returns false at the end of the level.
    pub(crate) fn advance_to_next_chunk(&mut self) -> Result<bool> {
        if self.len() > 0 {
            self.idx = self.len() - 1;
        }
        Ok(self.advance()? && self.idx == 0)
    }
}

/// Seats a cursor on the leaf item at position `idx`, chaining a parent
/// cursor at every meta level along the descent.
///
/// `idx == num_leaves` yields the one-past-end cursor: meta levels rest on
/// their last tuple and the leaf level on its one-past-end sentinel.
pub fn cursor_at_index<const N: usize>(
    store: &SharedStore<N>,
    root: Arc<SequenceNode<N>>,
    idx: u64,
) -> Result<SequenceCursor<N>> {
    let mut parent: Option<Box<SequenceCursor<N>>> = None;
    let mut node = root;
    let mut remaining = idx;

    loop {
        match node.as_ref() {
            SequenceNode::Meta { tuples, .. } => {
                let mut pos = 0usize;
                let mut leaves_before = 0u64;
                while pos + 1 < tuples.len() && remaining >= leaves_before + tuples[pos].num_leaves
                {
                    leaves_before += tuples[pos].num_leaves;
                    pos += 1;
                }
                remaining -= leaves_before;

                let child = store.read_value(&tuples[pos].child)?;
                parent = Some(Box::new(SequenceCursor::new(
                    parent.take(),
                    Arc::clone(store),
                    node,
                    pos as isize,
                )));
                node = child;
            }
            _ => {
                let len = node.len() as u64;
                let pos = remaining.min(len) as isize;
                return Ok(SequenceCursor::new(parent, Arc::clone(store), node, pos));
            }
        }
    }
}

/// Seats a cursor on the first map entry whose key is `>= key`, or on the
/// leaf one-past-end sentinel when every key is smaller.
pub fn cursor_at_key<const N: usize>(
    store: &SharedStore<N>,
    root: Arc<SequenceNode<N>>,
    key: &[u8],
) -> Result<SequenceCursor<N>> {
    let mut parent: Option<Box<SequenceCursor<N>>> = None;
    let mut node = root;

    loop {
        match node.as_ref() {
            SequenceNode::Meta { tuples, .. } => {
                let mut pos = 0usize;
                while pos + 1 < tuples.len() {
                    let past = match &tuples[pos].key {
                        OrderedKey::Value(k) => k.as_slice() >= key,
                        OrderedKey::Index(_) => return Err(ProllyError::InvalidCursor),
                    };
                    if past {
                        break;
                    }
                    pos += 1;
                }

                let child = store.read_value(&tuples[pos].child)?;
                parent = Some(Box::new(SequenceCursor::new(
                    parent.take(),
                    Arc::clone(store),
                    node,
                    pos as isize,
                )));
                node = child;
            }
            SequenceNode::MapLeaf(entries) => {
                let pos = entries.partition_point(|e| e.key.as_slice() < key);
                return Ok(SequenceCursor::new(
                    parent,
                    Arc::clone(store),
                    node,
                    pos as isize,
                ));
            }
            SequenceNode::BlobLeaf(_) => return Err(ProllyError::InvalidCursor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, Format};
    use crate::node::{MapEntry, MetaTuple};
    use crate::store::InMemoryStore;

    // Builds a two-level tree by hand: leaves of the given sizes under one
    // meta root.
    fn two_level_blob(leaf_sizes: &[usize]) -> (SharedStore<32>, Arc<SequenceNode<32>>) {
        let store: SharedStore<32> = InMemoryStore::shared(Format::default());
        let mut tuples = Vec::new();
        let mut next_byte = 0u8;
        for &size in leaf_sizes {
            let data: Vec<u8> = (0..size)
                .map(|_| {
                    next_byte = next_byte.wrapping_add(1);
                    next_byte
                })
                .collect();
            let node = SequenceNode::BlobLeaf(data);
            let child = store.write_value(&node).unwrap();
            tuples.push(MetaTuple {
                child,
                key: OrderedKey::Index(size as u64),
                num_leaves: size as u64,
            });
        }
        let root = SequenceNode::Meta { level: 1, tuples };
        store.write_value(&root).unwrap();
        (store, Arc::new(root))
    }

    fn byte_at(cur: &SequenceCursor<32>) -> u8 {
        match cur.current().unwrap() {
            SequenceItem::Byte(b) => b,
            other => panic!("expected byte item, got {other:?}"),
        }
    }

    #[test]
    fn test_cursor_at_index_positions_in_correct_leaf() {
        let (store, root) = two_level_blob(&[3, 4, 2]);

        // Leaf bytes are 1..=9 in order.
        for idx in 0..9u64 {
            let cur = cursor_at_index(&store, Arc::clone(&root), idx).unwrap();
            assert!(cur.valid());
            assert_eq!(byte_at(&cur), idx as u8 + 1, "at index {idx}");
        }
    }

    #[test]
    fn test_cursor_walks_forward_across_chunks() {
        let (store, root) = two_level_blob(&[3, 4, 2]);
        let mut cur = cursor_at_index(&store, root, 0).unwrap();

        let mut seen = vec![byte_at(&cur)];
        while cur.advance().unwrap() {
            seen.push(byte_at(&cur));
        }
        assert_eq!(seen, (1..=9).collect::<Vec<u8>>());
        assert!(!cur.valid());
    }

    #[test]
    fn test_cursor_walks_backward_across_chunks() {
        let (store, root) = two_level_blob(&[3, 4, 2]);
        let mut cur = cursor_at_index(&store, root, 8).unwrap();

        let mut seen = vec![byte_at(&cur)];
        while cur.retreat().unwrap() {
            seen.push(byte_at(&cur));
        }
        assert_eq!(seen, (1..=9).rev().collect::<Vec<u8>>());
        assert!(!cur.valid());
    }

    #[test]
    fn test_past_end_cursor_is_usable_but_invalid() {
        let (store, root) = two_level_blob(&[3, 4, 2]);
        let cur = cursor_at_index(&store, root, 9).unwrap();

        assert!(!cur.valid());
        assert!(cur.current().is_err());
        // Rests in the final leaf with the parent on the final tuple.
        assert_eq!(cur.index_in_chunk(), 2);
        assert!(cur.parent().unwrap().at_last_item());
    }

    #[test]
    fn test_advance_to_next_chunk() {
        let (store, root) = two_level_blob(&[3, 4, 2]);
        let mut cur = cursor_at_index(&store, root, 1).unwrap();

        assert!(cur.advance_to_next_chunk().unwrap());
        assert_eq!(byte_at(&cur), 4);
        assert!(cur.advance_to_next_chunk().unwrap());
        assert_eq!(byte_at(&cur), 8);
        assert!(!cur.advance_to_next_chunk().unwrap());
    }

    #[test]
    fn test_cursor_at_key_lower_bound() {
        let store: SharedStore<32> = InMemoryStore::shared(Format::new(ChunkConfig::default()));
        let entries: Vec<MapEntry> = [b"apple".as_slice(), b"mango", b"pear"]
            .iter()
            .map(|k| MapEntry {
                key: k.to_vec(),
                value: b"v".to_vec(),
            })
            .collect();
        let root = Arc::new(SequenceNode::MapLeaf(entries));
        store.write_value(&root).unwrap();

        let cur = cursor_at_key(&store, Arc::clone(&root), b"mango").unwrap();
        assert!(matches!(
            cur.current().unwrap(),
            SequenceItem::Entry(e) if e.key == b"mango"
        ));

        let cur = cursor_at_key(&store, Arc::clone(&root), b"banana").unwrap();
        assert!(matches!(
            cur.current().unwrap(),
            SequenceItem::Entry(e) if e.key == b"mango"
        ));

        let cur = cursor_at_key(&store, root, b"zebra").unwrap();
        assert!(!cur.valid());
    }
}
