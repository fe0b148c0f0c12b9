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
use crate::chunker::{ChunkMaker, SequenceChunker};
use crate::cursor::{cursor_at_index, SequenceCursor};
use crate::errors::{ProllyError, Result};
use crate::node::Sequence;

/// Splices two trees into one.
///
/// Works by tricking the chunker into resuming at a cursor to the end of
/// `fst`, then finalizing against the start of `snd`: the tower is seated
/// on `fst`'s right edge, and every level's resume cursor is swapped for
/// the corresponding cursor on `snd`'s left edge before finalization.
/// Only the two edge spines are read and rewritten.
///
/// The result is identical, root hash included, to chunking the
/// concatenated item stream from scratch.
pub(crate) fn concat<const N: usize>(
    fst: &Sequence<N>,
    snd: &Sequence<N>,
    maker: Arc<dyn ChunkMaker<N>>,
    cancel: &CancellationToken,
) -> Result<Sequence<N>> {
    if fst.num_leaves() == 0 {
        return Ok(snd.clone());
    }
    if snd.num_leaves() == 0 {
        return Ok(fst.clone());
    }
    if fst.store_id() != snd.store_id() {
        return Err(ProllyError::CrossDatabase);
    }

    let store = fst.store();
    let right_edge = cursor_at_index(&store, fst.root(), fst.num_leaves())?;
    let mut chunker = SequenceChunker::with_cursor(right_edge, store, maker, cancel.clone())?;

    let left_edge = cursor_at_index(&snd.store(), snd.root(), 0)?;
    splice(&mut chunker, Some(left_edge))?;

    chunker.done()
}

/// Assigns `cur` as this level's resume cursor and walks up, pairing each
/// chunker level with the matching cursor level of the second tree.
///
/// If the second tree is shallower, the upper levels get no cursor and
/// simply emit their accumulated state (their trailing meta-tuple was
/// already dropped by the right-edge resume). If the first tree is
/// shallower, parent chunkers are created so every level of the second
/// tree has a counterpart.
fn splice<const N: usize>(
    chunker: &mut SequenceChunker<N>,
    cur: Option<SequenceCursor<N>>,
) -> Result<()> {
    let next = cur.as_ref().and_then(|c| c.parent_cloned());
    chunker.set_cursor(cur);

    if next.is_some() && !chunker.has_parent() {
        chunker.create_parent()?;
    }
    if let Some(parent) = chunker.parent_mut() {
        splice(parent, next)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{BlobMaker, SequenceItem};
    use crate::config::{ChunkConfig, Format};
    use crate::store::{InMemoryStore, SharedStore};

    fn small_format() -> Format {
        Format::new(ChunkConfig {
            pattern: (1 << 5) - 1,
            window: 16,
            min_chunk_size: 1,
            max_chunk_size: 1 << 14,
        })
    }

    fn test_bytes(len: usize, mut state: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn build(store: &SharedStore<32>, data: &[u8]) -> Sequence<32> {
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

    fn join(a: &Sequence<32>, b: &Sequence<32>) -> Sequence<32> {
        concat(a, b, Arc::new(BlobMaker), &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_concat_matches_fresh_build_at_any_split() {
        let store: SharedStore<32> = InMemoryStore::shared(small_format());
        let data = test_bytes(24 * 1024, 7);
        let whole = build(&store, &data);

        for split in [1usize, 100, 4096, 12 * 1024, data.len() - 1] {
            let left = build(&store, &data[..split]);
            let right = build(&store, &data[split..]);
            let joined = join(&left, &right);
            assert_eq!(
                joined.root_ref(),
                whole.root_ref(),
                "split at {split} diverged"
            );
            assert_eq!(joined.num_leaves(), data.len() as u64);
        }
    }

    #[test]
    fn test_concat_uneven_depths() {
        let store: SharedStore<32> = InMemoryStore::shared(small_format());
        let big = test_bytes(32 * 1024, 3);
        let tiny = test_bytes(10, 4);

        let mut expected = big.clone();
        expected.extend_from_slice(&tiny);
        let whole = build(&store, &expected);

        // Deep fst, shallow snd.
        let joined = join(&build(&store, &big), &build(&store, &tiny));
        assert_eq!(joined.root_ref(), whole.root_ref());

        // Shallow fst, deep snd.
        let mut expected = tiny.clone();
        expected.extend_from_slice(&big);
        let whole = build(&store, &expected);
        let joined = join(&build(&store, &tiny), &build(&store, &big));
        assert_eq!(joined.root_ref(), whole.root_ref());
    }

    #[test]
    fn test_concat_with_empty_is_identity() {
        let store: SharedStore<32> = InMemoryStore::shared(small_format());
        let blob = build(&store, &test_bytes(8 * 1024, 9));
        let empty = build(&store, &[]);

        assert_eq!(join(&blob, &empty).root_ref(), blob.root_ref());
        assert_eq!(join(&empty, &blob).root_ref(), blob.root_ref());
    }

    #[test]
    fn test_concat_is_associative() {
        let store: SharedStore<32> = InMemoryStore::shared(small_format());
        let a = build(&store, &test_bytes(5000, 11));
        let b = build(&store, &test_bytes(7000, 12));
        let c = build(&store, &test_bytes(3000, 13));

        let left = join(&join(&a, &b), &c);
        let right = join(&a, &join(&b, &c));
        assert_eq!(left.root_ref(), right.root_ref());
    }

    #[test]
    fn test_concat_rejects_distinct_stores() {
        let store_a: SharedStore<32> = InMemoryStore::shared(small_format());
        let store_b: SharedStore<32> = InMemoryStore::shared(small_format());
        let a = build(&store_a, b"left bytes");
        let b = build(&store_b, b"right bytes");

        let err = concat(&a, &b, Arc::new(BlobMaker), &CancellationToken::new());
        assert!(matches!(err, Err(ProllyError::CrossDatabase)));
    }
}
