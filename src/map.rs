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
use crate::chunker::{ChunkMaker, MapMaker, SequenceChunker, SequenceItem};
use crate::cursor::{cursor_at_index, cursor_at_key, SequenceCursor};
use crate::digest::ValueDigest;
use crate::errors::{ProllyError, Result};
use crate::node::{MapEntry, Sequence, SequenceNode};
use crate::store::SharedStore;

pub(crate) fn map_maker<const N: usize>() -> Arc<dyn ChunkMaker<N>> {
    Arc::new(MapMaker)
}

/// An immutable ordered map backed by a prolly tree.
///
/// Entries are globally ordered by key; tree shape depends only on the
/// entries, so two maps holding the same pairs share a root hash.
#[derive(Debug, Clone)]
pub struct ProllyMap<const N: usize> {
    seq: Sequence<N>,
}

impl<const N: usize> ProllyMap<N> {
    /// A map with no entries.
    pub fn empty(store: SharedStore<N>) -> Result<Self> {
        Ok(ProllyMap {
            seq: Sequence::new(store, SequenceNode::MapLeaf(Vec::new()))?,
        })
    }

    /// Builds a map from entries already sorted by strictly increasing
    /// key. A repeated or out-of-order key fails with `UnsortedInput`.
    pub fn from_sorted(
        store: SharedStore<N>,
        entries: Vec<MapEntry>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let mut chunker = SequenceChunker::new_empty(store, map_maker(), cancel.clone());
        let mut last_key: Option<&[u8]> = None;
        for entry in &entries {
            if let Some(last) = last_key {
                if entry.key.as_slice() <= last {
                    return Err(ProllyError::UnsortedInput);
                }
            }
            last_key = Some(&entry.key);
            chunker.append(SequenceItem::Entry(entry.clone()))?;
        }
        Ok(ProllyMap {
            seq: chunker.done()?,
        })
    }

    pub(crate) fn from_sequence(seq: Sequence<N>) -> Self {
        ProllyMap { seq }
    }

    /// Number of entries.
    pub fn len(&self) -> u64 {
        self.seq.num_leaves()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root_ref(&self) -> ValueDigest<N> {
        self.seq.root_ref()
    }

    pub fn sequence(&self) -> &Sequence<N> {
        &self.seq
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let store = self.seq.store();
        let cur = cursor_at_key(&store, self.seq.root(), key)?;
        if !cur.valid() {
            return Ok(None);
        }
        match cur.current()? {
            SequenceItem::Entry(e) if e.key == key => Ok(Some(e.value)),
            SequenceItem::Entry(_) => Ok(None),
            _ => Err(ProllyError::InvalidCursor),
        }
    }

    /// In-order iteration over all entries.
    pub fn iter(&self) -> Result<MapIter<N>> {
        let store = self.seq.store();
        let cur = cursor_at_index(&store, self.seq.root(), 0)?;
        Ok(MapIter {
            cur: cur.valid().then_some(cur),
        })
    }
}

/// Iterator yielding map entries in key order.
pub struct MapIter<const N: usize> {
    cur: Option<SequenceCursor<N>>,
}

impl<const N: usize> Iterator for MapIter<N> {
    type Item = Result<MapEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur.as_mut()?;
        let entry = match cur.current() {
            Ok(SequenceItem::Entry(e)) => e,
            Ok(_) => {
                self.cur = None;
                return Some(Err(ProllyError::InvalidCursor));
            }
            Err(e) => {
                self.cur = None;
                return Some(Err(e));
            }
        };
        match cur.advance() {
            Ok(true) => {}
            Ok(false) => self.cur = None,
            Err(e) => {
                self.cur = None;
                return Some(Err(e));
            }
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, Format};
    use crate::store::InMemoryStore;

    fn small_store() -> SharedStore<32> {
        InMemoryStore::shared(Format::new(ChunkConfig {
            pattern: (1 << 5) - 1,
            window: 16,
            min_chunk_size: 1,
            max_chunk_size: 1 << 14,
        }))
    }

    fn entries(n: u32) -> Vec<MapEntry> {
        (0..n)
            .map(|i| MapEntry {
                key: format!("key_{i:08}").into_bytes(),
                value: format!("value_{i}").into_bytes(),
            })
            .collect()
    }

    #[test]
    fn test_empty_map() {
        let map = ProllyMap::empty(small_store()).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.get(b"anything").unwrap(), None);
        assert_eq!(map.iter().unwrap().count(), 0);
    }

    #[test]
    fn test_get_finds_every_entry() {
        let entries = entries(3000);
        let map =
            ProllyMap::from_sorted(small_store(), entries.clone(), &CancellationToken::new())
                .unwrap();

        assert_eq!(map.len(), 3000);
        for e in entries.iter().step_by(97) {
            assert_eq!(map.get(&e.key).unwrap().as_deref(), Some(e.value.as_slice()));
        }
        assert_eq!(map.get(b"key_99999999x").unwrap(), None);
        assert_eq!(map.get(b"aaa").unwrap(), None);
        assert_eq!(map.get(b"zzz").unwrap(), None);
    }

    #[test]
    fn test_iteration_is_in_key_order() {
        let entries = entries(2500);
        let map =
            ProllyMap::from_sorted(small_store(), entries.clone(), &CancellationToken::new())
                .unwrap();

        let seen: Vec<MapEntry> = map.iter().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(seen, entries);
    }

    #[test]
    fn test_same_entries_same_root() {
        let entries = entries(4000);
        let a = ProllyMap::from_sorted(small_store(), entries.clone(), &CancellationToken::new())
            .unwrap();
        let b =
            ProllyMap::from_sorted(small_store(), entries, &CancellationToken::new()).unwrap();
        assert_eq!(a.root_ref(), b.root_ref());
    }

    #[test]
    fn test_from_sorted_rejects_inversions_and_duplicates() {
        let mut out_of_order = entries(10);
        out_of_order.swap(3, 4);
        assert!(matches!(
            ProllyMap::from_sorted(small_store(), out_of_order, &CancellationToken::new()),
            Err(ProllyError::UnsortedInput)
        ));

        let mut duplicated = entries(10);
        duplicated[5] = duplicated[4].clone();
        assert!(matches!(
            ProllyMap::from_sorted(small_store(), duplicated, &CancellationToken::new()),
            Err(ProllyError::UnsortedInput)
        ));
    }
}
