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

use std::io::{self, Read, SeekFrom, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::cancel::{recv_cancelable, CancellationToken};
use crate::chunker::{BlobMaker, ChunkMaker, SequenceChunker, SequenceItem};
use crate::concat::concat;
use crate::cursor::cursor_at_index;
use crate::digest::ValueDigest;
use crate::errors::{ProllyError, Result};
use crate::node::{MetaTuple, OrderedKey, Sequence, SequenceNode};
use crate::rolling::RollingValueHasher;
use crate::store::SharedStore;

/// Read-buffer size for the single-reader build fast path.
const READ_BUF_SIZE: usize = 8192;

/// Defaults for [`Blob::copy`]: stay six 8 MiB blocks ahead of the writer.
const COPY_CHUNK_SIZE: u64 = 1 << 23;
const COPY_CONCURRENCY: usize = 6;

fn blob_maker<const N: usize>() -> Arc<dyn ChunkMaker<N>> {
    Arc::new(BlobMaker)
}

/// An immutable random-access byte sequence backed by a prolly tree.
///
/// Tree shape, and therefore the root hash, is a deterministic function of
/// the byte contents alone: the same bytes produce the same blob no matter
/// how they were delivered or how construction was parallelized.
#[derive(Debug, Clone)]
pub struct Blob<const N: usize> {
    seq: Sequence<N>,
}

impl<const N: usize> Blob<N> {
    /// A blob with no bytes.
    pub fn empty(store: SharedStore<N>) -> Result<Self> {
        Ok(Blob {
            seq: Sequence::new(store, SequenceNode::BlobLeaf(Vec::new()))?,
        })
    }

    /// Builds a blob by streaming `data` through the chunker on the
    /// calling thread.
    pub fn from_bytes(store: SharedStore<N>, data: &[u8], cancel: &CancellationToken) -> Result<Self> {
        let mut chunker = SequenceChunker::new_empty(store, blob_maker(), cancel.clone());
        for &b in data {
            chunker.append(SequenceItem::Byte(b))?;
        }
        Ok(Blob {
            seq: chunker.done()?,
        })
    }

    /// Builds a blob by reading every reader to exhaustion and
    /// concatenating the results in order, one builder thread per reader.
    ///
    /// A single reader takes a byte-level fast path: the producer feeds
    /// the rolling hasher directly, finished chunks are persisted by
    /// worker threads, and their meta-tuples are consumed strictly in
    /// chunk order so the tree shape stays deterministic.
    pub fn from_readers(
        store: SharedStore<N>,
        mut readers: Vec<Box<dyn Read + Send>>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        match readers.len() {
            0 => Blob::empty(store),
            1 => {
                let reader = match readers.pop() {
                    Some(r) => r,
                    None => unreachable!(),
                };
                read_blob(store, reader, cancel)
            }
            _ => thread::scope(|s| {
                let handles: Vec<_> = readers
                    .into_iter()
                    .enumerate()
                    .map(|(i, reader)| {
                        let store = Arc::clone(&store);
                        let cancel = cancel.clone();
                        thread::Builder::new()
                            .name(format!("blob-reader-{i}"))
                            .spawn_scoped(s, move || read_blob(store, reader, &cancel))
                    })
                    .collect();

                let mut blobs = Vec::with_capacity(handles.len());
                for handle in handles {
                    match handle?.join() {
                        Ok(result) => blobs.push(result?),
                        Err(panic) => std::panic::resume_unwind(panic),
                    }
                }

                let mut joined = blobs.remove(0);
                for other in blobs {
                    joined = joined.concat(&other, cancel)?;
                }
                Ok(joined)
            }),
        }
    }

    pub(crate) fn from_sequence(seq: Sequence<N>) -> Self {
        Blob { seq }
    }

    /// Total number of bytes.
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

    /// Reads bytes starting at `off` into `buf`, walking forward through
    /// leaf chunks until `buf` is full or the blob ends. Returns the byte
    /// count and whether the end of the blob was reached.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<(usize, bool)> {
        let len = self.len();
        if off >= len {
            return Ok((0, true));
        }

        let end = (off + buf.len() as u64).min(len);
        let eof = end == len;
        let wanted = (end - off) as usize;
        if wanted == 0 {
            return Ok((0, eof));
        }

        let store = self.seq.store();
        let mut cur = cursor_at_index(&store, self.seq.root(), off)?;
        let mut n = 0usize;
        loop {
            let copied = {
                let SequenceNode::BlobLeaf(data) = cur.node() else {
                    return Err(ProllyError::InvalidCursor);
                };
                let start = cur.index_in_chunk() as usize;
                let src = &data[start..];
                let take = src.len().min(wanted - n);
                buf[n..n + take].copy_from_slice(&src[..take]);
                take
            };
            n += copied;
            if n == wanted {
                return Ok((n, eof));
            }
            if !cur.advance_to_next_chunk()? {
                return Ok((n, true));
            }
        }
    }

    /// A stateful forward reader over the blob.
    pub fn reader(&self) -> BlobReader<N> {
        BlobReader {
            blob: self.clone(),
            pos: 0,
        }
    }

    /// Streams the whole blob to `w` with the default read-ahead window.
    pub fn copy<W: Write>(&self, w: &mut W, cancel: &CancellationToken) -> Result<u64> {
        self.copy_read_ahead(w, COPY_CHUNK_SIZE, COPY_CONCURRENCY, cancel)
    }

    /// Streams the whole blob to `w`, keeping up to `concurrency` chunk
    /// fetches of `chunk_size` bytes in flight ahead of the writer.
    ///
    /// Fetches are dispatched and consumed in issue order, so bytes reach
    /// `w` in strict ascending offset order regardless of which fetch
    /// finishes first.
    pub fn copy_read_ahead<W: Write>(
        &self,
        w: &mut W,
        chunk_size: u64,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let len = self.len();
        let chunk_size = chunk_size.max(1);
        let (slot_tx, slot_rx) =
            mpsc::sync_channel::<mpsc::Receiver<Result<Vec<u8>>>>(concurrency.max(1));

        thread::scope(|s| {
            let blob = self.clone();
            let producer_cancel = cancel.clone();
            s.spawn(move || {
                let mut idx = 0u64;
                while idx < len && !producer_cancel.is_canceled() {
                    let start = idx;
                    let block = (len - start).min(chunk_size);
                    idx += block;

                    let (tx, rx) = mpsc::sync_channel::<Result<Vec<u8>>>(1);
                    if slot_tx.send(rx).is_err() {
                        // Consumer bailed; discard the remaining work.
                        return;
                    }

                    let fetch_blob = blob.clone();
                    let fetch_cancel = producer_cancel.clone();
                    s.spawn(move || {
                        let result = if fetch_cancel.is_canceled() {
                            Err(ProllyError::Canceled)
                        } else {
                            let mut buf = vec![0u8; block as usize];
                            fetch_blob.read_at(&mut buf, start).map(|_| buf)
                        };
                        let _ = tx.send(result);
                    });
                }
            });

            let mut written = 0u64;
            while let Some(rx) = recv_cancelable(&slot_rx, cancel)? {
                let chunk = match recv_cancelable(&rx, cancel)? {
                    Some(result) => result?,
                    None => return Err(ProllyError::Canceled),
                };
                w.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            Ok(written)
        })
    }

    /// Joins this blob with `other`, touching only the rightmost chunks of
    /// `self` and the leftmost chunks of `other`.
    pub fn concat(&self, other: &Blob<N>, cancel: &CancellationToken) -> Result<Blob<N>> {
        let seq = concat(&self.seq, &other.seq, blob_maker(), cancel)?;
        Ok(Blob { seq })
    }
}

/// Persists one finished leaf chunk and returns its meta-tuple.
fn chunk_blob_leaf<const N: usize>(
    store: &SharedStore<N>,
    bytes: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<MetaTuple<N>> {
    cancel.checked()?;
    let num_leaves = bytes.len() as u64;
    let node = SequenceNode::BlobLeaf(bytes);
    let child = store.write_value(&node)?;
    Ok(MetaTuple {
        child,
        key: OrderedKey::Index(num_leaves),
        num_leaves,
    })
}

/// Single-reader build: byte-level chunking on the producer thread with
/// leaf persistence handed off to worker threads, one per chunk. The
/// per-chunk result channels are queued in chunk order and drained in that
/// same order, so the level-1 chunker sees meta-tuples exactly as a
/// sequential build would.
fn read_blob<const N: usize>(
    store: SharedStore<N>,
    mut reader: Box<dyn Read + Send + '_>,
    cancel: &CancellationToken,
) -> Result<Blob<N>> {
    let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let (mt_tx, mt_rx) = mpsc::sync_channel::<mpsc::Receiver<Result<MetaTuple<N>>>>(workers);

    let mut chunker = SequenceChunker::new_empty(Arc::clone(&store), blob_maker(), cancel.clone());

    thread::scope(|s| {
        let producer_store = Arc::clone(&store);
        let producer_cancel = cancel.clone();
        s.spawn(move || {
            let mut rv = RollingValueHasher::new(producer_store.format().chunk(), 0);
            let mut chunk: Vec<u8> = Vec::with_capacity(READ_BUF_SIZE);
            let mut read_buf = [0u8; READ_BUF_SIZE];

            // Queue slot first, then spawn the worker: queue order is chunk
            // order, which the consumer relies on.
            let dispatch = |chunk: &mut Vec<u8>| -> bool {
                let bytes = std::mem::take(chunk);
                let (tx, rx) = mpsc::sync_channel::<Result<MetaTuple<N>>>(1);
                if mt_tx.send(rx).is_err() {
                    return false;
                }
                let worker_store = Arc::clone(&producer_store);
                let worker_cancel = producer_cancel.clone();
                s.spawn(move || {
                    let _ = tx.send(chunk_blob_leaf(&worker_store, bytes, &worker_cancel));
                });
                true
            };

            loop {
                if producer_cancel.is_canceled() {
                    return;
                }
                match reader.read(&mut read_buf) {
                    Ok(0) => {
                        if !chunk.is_empty() {
                            dispatch(&mut chunk);
                        }
                        return;
                    }
                    Ok(n) => {
                        for &b in &read_buf[..n] {
                            chunk.push(b);
                            if rv.hash_byte(b) {
                                rv.reset();
                                if !dispatch(&mut chunk) {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Surface the reader failure in chunk order.
                        let (tx, rx) = mpsc::sync_channel::<Result<MetaTuple<N>>>(1);
                        let _ = tx.send(Err(e.into()));
                        let _ = mt_tx.send(rx);
                        return;
                    }
                }
            }
        });

        while let Some(rx) = recv_cancelable(&mt_rx, cancel)? {
            let mt = match recv_cancelable(&rx, cancel)? {
                Some(result) => result?,
                None => return Err(ProllyError::Canceled),
            };
            chunker.append_to_parent(mt)?;
        }

        Ok(Blob {
            seq: chunker.done()?,
        })
    })
}

/// Forward reader with standard seek semantics over a [`Blob`].
#[derive(Debug, Clone)]
pub struct BlobReader<const N: usize> {
    blob: Blob<N>,
    pos: i64,
}

impl<const N: usize> BlobReader<N> {
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Repositions the reader. Negative absolute positions are rejected;
    /// seeking past the end is allowed and reads there return EOF.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let abs = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset)
                .map_err(|_| ProllyError::InvalidSeek(format!("offset {offset} out of range")))?,
            SeekFrom::Current(delta) => self.pos + delta,
            SeekFrom::End(delta) => self.blob.len() as i64 + delta,
        };
        if abs < 0 {
            return Err(ProllyError::InvalidSeek(format!("negative position {abs}")));
        }
        self.pos = abs;
        Ok(abs as u64)
    }
}

impl<const N: usize> Read for BlobReader<N> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _) = self
            .blob
            .read_at(buf, self.pos as u64)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as i64;
        Ok(n)
    }
}

impl<const N: usize> io::Seek for BlobReader<N> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        BlobReader::seek(self, pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}
