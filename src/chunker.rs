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

use crate::cancel::CancellationToken;
use crate::cursor::SequenceCursor;
use crate::errors::Result;
use crate::node::{MapEntry, MetaTuple, OrderedKey, Sequence, SequenceNode};
use crate::rolling::RollingValueHasher;
use crate::store::SharedStore;

/// The unit a chunker ingests. The variant depends on the level and tree
/// kind: bytes for blob leaves, entries for map leaves, meta-tuples for
/// every internal level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceItem<const N: usize> {
    Byte(u8),
    Entry(MapEntry),
    Meta(MetaTuple<N>),
}

/// Per-tree-kind chunking policy injected at chunker construction: how
/// leaf runs become nodes, how meta nodes are keyed, and which bytes of a
/// leaf item feed boundary detection.
pub trait ChunkMaker<const N: usize>: Send + Sync {
    /// Builds a leaf node from a run of items, returning the node, its
    /// ordered key, and its leaf count.
    fn make_leaf(&self, items: &[SequenceItem<N>]) -> (SequenceNode<N>, OrderedKey, u64);

    /// The ordered key of a meta node holding `tuples`.
    fn meta_key(&self, tuples: &[MetaTuple<N>]) -> OrderedKey;

    /// Feeds one leaf item's identifying bytes to the rolling hasher.
    fn hash_leaf_item(&self, item: &SequenceItem<N>, rv: &mut RollingValueHasher);
}

/// Indexed chunking for byte sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobMaker;

impl<const N: usize> ChunkMaker<N> for BlobMaker {
    fn make_leaf(&self, items: &[SequenceItem<N>]) -> (SequenceNode<N>, OrderedKey, u64) {
        let data: Vec<u8> = items
            .iter()
            .map(|item| match item {
                SequenceItem::Byte(b) => *b,
                other => unreachable!("blob leaf items are bytes, got {other:?}"),
            })
            .collect();
        let count = data.len() as u64;
        (
            SequenceNode::BlobLeaf(data),
            OrderedKey::Index(count),
            count,
        )
    }

    fn meta_key(&self, tuples: &[MetaTuple<N>]) -> OrderedKey {
        let sum = tuples
            .iter()
            .map(|t| match &t.key {
                OrderedKey::Index(n) => *n,
                OrderedKey::Value(_) => unreachable!("indexed sequences use index keys"),
            })
            .sum();
        OrderedKey::Index(sum)
    }

    fn hash_leaf_item(&self, item: &SequenceItem<N>, rv: &mut RollingValueHasher) {
        match item {
            SequenceItem::Byte(b) => {
                rv.hash_byte(*b);
            }
            other => unreachable!("blob leaf items are bytes, got {other:?}"),
        }
    }
}

/// Ordered chunking for key/value sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapMaker;

impl<const N: usize> ChunkMaker<N> for MapMaker {
    fn make_leaf(&self, items: &[SequenceItem<N>]) -> (SequenceNode<N>, OrderedKey, u64) {
        let entries: Vec<MapEntry> = items
            .iter()
            .map(|item| match item {
                SequenceItem::Entry(e) => e.clone(),
                other => unreachable!("map leaf items are entries, got {other:?}"),
            })
            .collect();
        let count = entries.len() as u64;
        let key = entries
            .last()
            .map(|e| OrderedKey::Value(e.key.clone()))
            .unwrap_or(OrderedKey::Value(Vec::new()));
        (SequenceNode::MapLeaf(entries), key, count)
    }

    fn meta_key(&self, tuples: &[MetaTuple<N>]) -> OrderedKey {
        tuples
            .last()
            .map(|t| t.key.clone())
            .unwrap_or(OrderedKey::Value(Vec::new()))
    }

    fn hash_leaf_item(&self, item: &SequenceItem<N>, rv: &mut RollingValueHasher) {
        match item {
            SequenceItem::Entry(e) => {
                hash_len_prefixed(&e.key, rv);
                hash_len_prefixed(&e.value, rv);
            }
            other => unreachable!("map leaf items are entries, got {other:?}"),
        }
    }
}

fn hash_len_prefixed(bytes: &[u8], rv: &mut RollingValueHasher) {
    rv.hash_bytes(&(bytes.len() as u32).to_le_bytes());
    rv.hash_bytes(bytes);
}

/// Feeds a meta-tuple's identifying bytes (child reference plus ordered
/// key) to the rolling hasher. Shared by every internal level.
fn hash_meta_tuple<const N: usize>(mt: &MetaTuple<N>, rv: &mut RollingValueHasher) {
    rv.hash_bytes(mt.child.as_bytes());
    match &mt.key {
        OrderedKey::Index(n) => {
            rv.hash_bytes(&n.to_le_bytes());
        }
        OrderedKey::Value(k) => hash_len_prefixed(k, rv),
    }
}

/// The per-level chunk builder.
///
/// A chunker accumulates items at one level and emits a node whenever the
/// rolling hasher reports a boundary; the emitted node's meta-tuple
/// becomes an item of the parent chunker, created lazily one level up.
/// The linked chain of chunkers builds one whole tree.
///
/// A chunker constructed over a cursor resumes from that position: the
/// prefix of the cursor's chunk is replayed to rebuild rolling-hash
/// context, the caller appends (or skips) items, and
/// [`done`](Self::done) re-synchronizes with the unchanged suffix of the
/// original tree instead of rebuilding it.
pub struct SequenceChunker<const N: usize> {
    store: SharedStore<N>,
    maker: Arc<dyn ChunkMaker<N>>,
    level: u64,
    cur: Option<SequenceCursor<N>>,
    parent: Option<Box<SequenceChunker<N>>>,
    current: Vec<SequenceItem<N>>,
    rv: RollingValueHasher,
    cancel: CancellationToken,
}

impl<const N: usize> SequenceChunker<N> {
    /// A chunker for building a sequence from scratch.
    pub fn new_empty(
        store: SharedStore<N>,
        maker: Arc<dyn ChunkMaker<N>>,
        cancel: CancellationToken,
    ) -> Self {
        Self::raw(store, maker, 0, None, cancel)
    }

    /// A chunker resuming from a position in an existing sequence. The
    /// cursor's chunk prefix is replayed immediately; items appended
    /// afterwards land at the cursor position.
    pub fn with_cursor(
        cur: SequenceCursor<N>,
        store: SharedStore<N>,
        maker: Arc<dyn ChunkMaker<N>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Self::new_at_level(cur.level(), Some(cur), store, maker, cancel)
    }

    fn new_at_level(
        level: u64,
        cur: Option<SequenceCursor<N>>,
        store: SharedStore<N>,
        maker: Arc<dyn ChunkMaker<N>>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut chunker = Self::raw(store, maker, level, cur, cancel);
        if chunker.cur.is_some() {
            chunker.resume()?;
        }
        Ok(chunker)
    }

    fn raw(
        store: SharedStore<N>,
        maker: Arc<dyn ChunkMaker<N>>,
        level: u64,
        cur: Option<SequenceCursor<N>>,
        cancel: CancellationToken,
    ) -> Self {
        let rv = RollingValueHasher::new(store.format().chunk(), (level % 256) as u8);
        SequenceChunker {
            store,
            maker,
            level,
            cur,
            parent: None,
            current: Vec::new(),
            rv,
            cancel,
        }
    }

    fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Replays the prefix of the resume cursor's chunk so that appends
    /// continue with the same rolling-hash context the original build had.
    fn resume(&mut self) -> Result<()> {
        let Some(mut cur) = self.cur.take() else {
            return Ok(());
        };

        if cur.has_parent() && self.parent.is_none() {
            self.create_parent_for(&cur)?;
        }

        let target = cur.index_in_chunk();

        // Walk backwards to the start of the existing chunk.
        while cur.index_in_chunk() > 0 {
            cur.retreat_maybe_allow_before_start(false)?;
        }

        while cur.index_in_chunk() < target {
            let item = cur.current()?;
            self.append(item)?;
            cur.advance_maybe_allow_past_end(true)?;
        }

        self.cur = Some(cur);
        Ok(())
    }

    /// Adds one item, returning whether it closed a chunk.
    pub fn append(&mut self, item: SequenceItem<N>) -> Result<bool> {
        self.cancel.checked()?;

        match &item {
            SequenceItem::Meta(mt) => hash_meta_tuple(mt, &mut self.rv),
            leaf_item => {
                let maker = Arc::clone(&self.maker);
                maker.hash_leaf_item(leaf_item, &mut self.rv);
            }
        }
        self.current.push(item);

        if self.rv.crossed_boundary {
            self.handle_chunk_boundary()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Advances the resume cursor past one item of the original sequence
    /// without re-appending it, i.e. deletes it from the result. Crossing
    /// into the next chunk skips the parent chunker along.
    pub fn skip(&mut self) -> Result<()> {
        let crossed = match self.cur.as_mut() {
            Some(cur) => cur.advance()? && cur.index_in_chunk() == 0,
            None => false,
        };
        if crossed {
            if let Some(parent) = self.parent.as_mut() {
                parent.skip()?;
            }
        }
        Ok(())
    }

    fn handle_chunk_boundary(&mut self) -> Result<()> {
        debug_assert!(!self.current.is_empty());
        self.rv.reset();
        if self.parent.is_none() {
            self.create_parent()?;
        }
        let mt = self.create_chunk()?;
        if let Some(parent) = self.parent.as_mut() {
            parent.append(SequenceItem::Meta(mt))?;
        }
        Ok(())
    }

    /// Allocates the parent chunker one level up, seated at the resume
    /// cursor's parent when there is one so the resume context carries up
    /// the spine.
    pub(crate) fn create_parent(&mut self) -> Result<()> {
        debug_assert!(self.parent.is_none());
        let parent_cur = self.cur.as_ref().and_then(|c| c.parent_cloned());
        self.parent = Some(Box::new(Self::new_at_level(
            self.level + 1,
            parent_cur,
            Arc::clone(&self.store),
            Arc::clone(&self.maker),
            self.cancel.clone(),
        )?));
        Ok(())
    }

    fn create_parent_for(&mut self, cur: &SequenceCursor<N>) -> Result<()> {
        debug_assert!(self.parent.is_none());
        // Clone the parent cursor: advancing this level's cursor must not
        // drag the parent chunker's position. skip() moves the parent
        // explicitly when a chunk boundary is crossed.
        let parent_cur = cur.parent_cloned();
        self.parent = Some(Box::new(Self::new_at_level(
            self.level + 1,
            parent_cur,
            Arc::clone(&self.store),
            Arc::clone(&self.maker),
            self.cancel.clone(),
        )?));
        Ok(())
    }

    /// Builds (but does not persist or clear) a node from the accumulated
    /// run.
    fn create_node(&self) -> (SequenceNode<N>, OrderedKey, u64) {
        if self.is_leaf() {
            self.maker.make_leaf(&self.current)
        } else {
            let tuples: Vec<MetaTuple<N>> = self
                .current
                .iter()
                .map(|item| match item {
                    SequenceItem::Meta(mt) => mt.clone(),
                    other => unreachable!("internal items are meta-tuples, got {other:?}"),
                })
                .collect();
            let key = self.maker.meta_key(&tuples);
            let num_leaves = tuples.iter().map(|t| t.num_leaves).sum();
            (
                SequenceNode::Meta {
                    level: self.level,
                    tuples,
                },
                key,
                num_leaves,
            )
        }
    }

    /// Persists the accumulated run and hands back its meta-tuple.
    fn create_chunk(&mut self) -> Result<MetaTuple<N>> {
        let (node, key, num_leaves) = self.create_node();
        let child = self.store.write_value(&node)?;
        tracing::debug!(level = self.level, items = self.current.len(), r = %child, "chunk boundary");
        self.current.clear();
        Ok(MetaTuple {
            child,
            key,
            num_leaves,
        })
    }

    /// Routes an externally produced meta-tuple to the parent chunker,
    /// creating it on first use. This is the hand-off point for builders
    /// that chunk leaf items off-thread.
    pub(crate) fn append_to_parent(&mut self, mt: MetaTuple<N>) -> Result<()> {
        if self.parent.is_none() {
            self.create_parent()?;
        }
        if let Some(parent) = self.parent.as_mut() {
            parent.append(SequenceItem::Meta(mt))?;
        }
        Ok(())
    }

    pub(crate) fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub(crate) fn parent_mut(&mut self) -> Option<&mut SequenceChunker<N>> {
        self.parent.as_deref_mut()
    }

    pub(crate) fn set_cursor(&mut self, cur: Option<SequenceCursor<N>>) {
        self.cur = cur;
    }

    /// True when some parent level still holds accumulated items or an
    /// unconsumed resume cursor, i.e. this level cannot be the root.
    fn any_pending(&self) -> bool {
        match &self.parent {
            None => false,
            Some(parent) => {
                parent.cur.is_some() || !parent.current.is_empty() || parent.any_pending()
            }
        }
    }

    /// Replays the unconsumed tail of the resume cursor. Stops early when
    /// a fresh boundary lands exactly on an existing chunk end: from that
    /// point on the original tree is unchanged and the parent level reuses
    /// its remaining meta-tuples wholesale.
    fn finalize_cursor(&mut self) -> Result<()> {
        let Some(mut cur) = self.cur.take() else {
            return Ok(());
        };

        loop {
            if !cur.valid() {
                break;
            }
            let item = cur.current()?;
            let crossed = self.append(item)?;
            if crossed && cur.at_last_item() {
                // Boundary occurred at the same place in the old and new
                // sequence; the remainder is copied over at the parent
                // level.
                break;
            }
            if cur.advance()? && cur.index_in_chunk() == 0 {
                if let Some(parent) = self.parent.as_mut() {
                    parent.skip()?;
                }
            }
        }

        // Move the parent past the chunk we just consumed so its own
        // finalization starts at the first untouched tuple.
        if let Some(parent) = self.parent.as_mut() {
            parent.skip()?;
        }
        Ok(())
    }

    /// Finalizes the tower and returns the committed root sequence.
    pub fn done(mut self) -> Result<Sequence<N>> {
        self.cancel.checked()?;

        if self.cur.is_some() {
            self.finalize_cursor()?;
        }

        if self.any_pending() {
            // Some parent holds content, so this level cannot be the
            // root. End of input is an implicit chunk boundary.
            if !self.current.is_empty() {
                self.handle_chunk_boundary()?;
            }
            let parent = match self.parent.take() {
                Some(parent) => parent,
                None => unreachable!("pending content implies a parent chunker"),
            };
            return parent.done();
        }

        // This chunker's run holds every item of the resulting tree at
        // this level. A leaf run or a multi-tuple run is the canonical
        // root as-is.
        if self.is_leaf() || self.current.len() > 1 {
            let (node, _, _) = self.create_node();
            return Sequence::new(self.store, node);
        }

        // A single meta-tuple at the top is a non-canonical spine
        // extension: walk down until a leaf or a multi-item node.
        debug_assert_eq!(self.current.len(), 1);
        let mut mt = match &self.current[0] {
            SequenceItem::Meta(mt) => mt.clone(),
            other => unreachable!("internal items are meta-tuples, got {other:?}"),
        };
        loop {
            let child = self.store.read_value(&mt.child)?;
            match child.as_ref() {
                SequenceNode::Meta { tuples, .. } if tuples.len() == 1 => {
                    mt = tuples[0].clone();
                }
                _ => return Ok(Sequence::from_parts(self.store, child, mt.child)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, Format};
    use crate::cursor::cursor_at_index;
    use crate::store::InMemoryStore;

    // Small chunks so that a few kilobytes of input already produce a
    // multi-level tree.
    fn small_format() -> Format {
        Format::new(ChunkConfig {
            pattern: (1 << 5) - 1,
            window: 16,
            min_chunk_size: 1,
            max_chunk_size: 1 << 14,
        })
    }

    fn test_store() -> SharedStore<32> {
        InMemoryStore::shared(small_format())
    }

    fn test_bytes(len: usize) -> Vec<u8> {
        let mut state = 0xDEAD_BEEF_CAFE_F00Du64;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn build_blob(store: &SharedStore<32>, data: &[u8]) -> Sequence<32> {
        let mut chunker = SequenceChunker::new_empty(
            Arc::clone(store),
            Arc::new(BlobMaker),
            CancellationToken::new(),
        );
        for &b in data {
            chunker.append(SequenceItem::Byte(b)).unwrap();
        }
        chunker.done().unwrap()
    }

    fn read_all(seq: &Sequence<32>) -> Vec<u8> {
        let store = seq.store();
        let mut cur = cursor_at_index(&store, seq.root(), 0).unwrap();
        let mut out = Vec::new();
        if !cur.valid() {
            return out;
        }
        loop {
            match cur.current().unwrap() {
                SequenceItem::Byte(b) => out.push(b),
                other => panic!("expected byte, got {other:?}"),
            }
            if !cur.advance().unwrap() {
                return out;
            }
        }
    }

    #[test]
    fn test_empty_build_is_an_empty_leaf() {
        let store = test_store();
        let seq = build_blob(&store, &[]);
        assert_eq!(seq.level(), 0);
        assert_eq!(seq.num_leaves(), 0);
    }

    #[test]
    fn test_small_build_root_is_a_leaf() {
        let store = test_store();
        let seq = build_blob(&store, b"tiny");
        assert_eq!(seq.level(), 0);
        assert_eq!(seq.num_leaves(), 4);
        assert_eq!(read_all(&seq), b"tiny");
    }

    #[test]
    fn test_large_build_forms_a_tree_and_round_trips() {
        let store = test_store();
        let data = test_bytes(16 * 1024);
        let seq = build_blob(&store, &data);

        assert!(seq.level() >= 1, "expected a multi-level tree");
        assert_eq!(seq.num_leaves(), data.len() as u64);
        assert_eq!(read_all(&seq), data);
    }

    #[test]
    fn test_build_is_deterministic() {
        let data = test_bytes(32 * 1024);
        let a = build_blob(&test_store(), &data);
        let b = build_blob(&test_store(), &data);
        assert_eq!(a.root_ref(), b.root_ref());
    }

    #[test]
    fn test_resume_without_edits_preserves_root() {
        let store = test_store();
        let data = test_bytes(16 * 1024);
        let original = build_blob(&store, &data);

        for idx in [0u64, 1, 513, data.len() as u64 / 2, data.len() as u64] {
            let cur = cursor_at_index(&store, original.root(), idx).unwrap();
            let chunker = SequenceChunker::with_cursor(
                cur,
                Arc::clone(&store),
                Arc::new(BlobMaker),
                CancellationToken::new(),
            )
            .unwrap();
            let rebuilt = chunker.done().unwrap();
            assert_eq!(
                rebuilt.root_ref(),
                original.root_ref(),
                "resume at {idx} changed the tree"
            );
        }
    }

    #[test]
    fn test_insert_through_cursor_matches_fresh_build() {
        let store = test_store();
        let data = test_bytes(8 * 1024);
        let original = build_blob(&store, &data);
        let insert = test_bytes(700);

        for &at in &[0usize, 37, 4096, data.len()] {
            let cur = cursor_at_index(&store, original.root(), at as u64).unwrap();
            let mut chunker = SequenceChunker::with_cursor(
                cur,
                Arc::clone(&store),
                Arc::new(BlobMaker),
                CancellationToken::new(),
            )
            .unwrap();
            for &b in &insert {
                chunker.append(SequenceItem::Byte(b)).unwrap();
            }
            let edited = chunker.done().unwrap();

            let mut expected_bytes = data[..at].to_vec();
            expected_bytes.extend_from_slice(&insert);
            expected_bytes.extend_from_slice(&data[at..]);
            let expected = build_blob(&store, &expected_bytes);

            assert_eq!(
                edited.root_ref(),
                expected.root_ref(),
                "insert at {at} diverged from fresh build"
            );
        }
    }

    #[test]
    fn test_delete_through_skip_matches_fresh_build() {
        let store = test_store();
        let data = test_bytes(8 * 1024);
        let original = build_blob(&store, &data);

        let at = 1024usize;
        let removed = 600usize;
        let cur = cursor_at_index(&store, original.root(), at as u64).unwrap();
        let mut chunker = SequenceChunker::with_cursor(
            cur,
            Arc::clone(&store),
            Arc::new(BlobMaker),
            CancellationToken::new(),
        )
        .unwrap();
        for _ in 0..removed {
            chunker.skip().unwrap();
        }
        let edited = chunker.done().unwrap();

        let mut expected_bytes = data[..at].to_vec();
        expected_bytes.extend_from_slice(&data[at + removed..]);
        let expected = build_blob(&store, &expected_bytes);

        assert_eq!(edited.root_ref(), expected.root_ref());
        assert_eq!(read_all(&edited), expected_bytes);
    }

    #[test]
    fn test_canceled_token_fails_append_and_done() {
        let store = test_store();
        let cancel = CancellationToken::new();
        let mut chunker =
            SequenceChunker::new_empty(Arc::clone(&store), Arc::new(BlobMaker), cancel.clone());
        chunker.append(SequenceItem::Byte(1)).unwrap();

        cancel.cancel();
        assert!(matches!(
            chunker.append(SequenceItem::Byte(2)),
            Err(crate::errors::ProllyError::Canceled)
        ));
        assert!(matches!(
            chunker.done(),
            Err(crate::errors::ProllyError::Canceled)
        ));
    }

    #[test]
    fn test_map_build_round_trips_entries() {
        let store = test_store();
        let mut chunker = SequenceChunker::new_empty(
            Arc::clone(&store),
            Arc::new(MapMaker),
            CancellationToken::new(),
        );
        let mut keys = Vec::new();
        for i in 0..2000u32 {
            let key = format!("key_{i:08}").into_bytes();
            keys.push(key.clone());
            chunker
                .append(SequenceItem::Entry(MapEntry {
                    key,
                    value: format!("value_{i}").into_bytes(),
                }))
                .unwrap();
        }
        let seq = chunker.done().unwrap();

        assert!(seq.level() >= 1);
        assert_eq!(seq.num_leaves(), 2000);

        let mut cur = cursor_at_index(&store, seq.root(), 0).unwrap();
        let mut seen = Vec::new();
        while cur.valid() {
            match cur.current().unwrap() {
                SequenceItem::Entry(e) => seen.push(e.key),
                other => panic!("expected entry, got {other:?}"),
            }
            cur.advance().unwrap();
        }
        assert_eq!(seen, keys);
    }
}
