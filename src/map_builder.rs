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

use std::io;
use std::sync::mpsc;
use std::thread;

use crate::cancel::{recv_cancelable, CancellationToken};
use crate::chunker::{SequenceChunker, SequenceItem};
use crate::errors::{ProllyError, Result};
use crate::map::{map_maker, ProllyMap};
use crate::node::MapEntry;
use crate::store::SharedStore;

/// Builds a map from a strictly increasing stream of key/value pairs.
///
/// Keys and values are sent alternately over a rendezvous channel to a
/// background consumer thread, which pairs them back up and drives a map
/// chunker. `write` blocks until the consumer has taken the pair; `close`
/// blocks until the consumer has finalized the tree.
///
/// Any failure — an out-of-order key, a store error, cancellation — puts
/// the builder into a terminal state: the channel is closed, the same
/// error is returned from every later call, and nothing more is built.
pub struct StreamingMapBuilder<const N: usize> {
    tx: Option<mpsc::SyncSender<Vec<u8>>>,
    consumer: Option<thread::JoinHandle<Result<ProllyMap<N>>>>,
    last_key: Option<Vec<u8>>,
    failed: Option<ProllyError>,
    result: Option<ProllyMap<N>>,
}

impl<const N: usize> StreamingMapBuilder<N> {
    pub fn new(store: SharedStore<N>, cancel: &CancellationToken) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(0);
        let cancel = cancel.clone();
        let consumer = thread::Builder::new()
            .name("map-chunker".into())
            .spawn(move || consume(store, rx, cancel))?;
        Ok(StreamingMapBuilder {
            tx: Some(tx),
            consumer: Some(consumer),
            last_key: None,
            failed: None,
            result: None,
        })
    }

    /// Feeds one entry. The key must be strictly greater than the previous
    /// one; otherwise the builder fails with `UnsortedInput` and refuses
    /// all further writes.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(repeat_error(err));
        }
        if self.tx.is_none() {
            return Err(ProllyError::AlreadyClosed);
        }

        let unsorted = self.last_key.as_deref().is_some_and(|last| key <= last);
        if unsorted {
            return Err(self.fail(ProllyError::UnsortedInput));
        }

        if self.send(key.to_vec()).is_err() || self.send(value.to_vec()).is_err() {
            // The consumer is gone; its error explains why.
            let err = self.consumer_error();
            return Err(self.fail(err));
        }

        self.last_key = Some(key.to_vec());
        Ok(())
    }

    /// Flushes the stream and finalizes the map. After a successful close
    /// the builder owns the result and further writes fail with
    /// `AlreadyClosed`.
    pub fn close(&mut self) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(repeat_error(err));
        }
        if self.result.is_some() {
            return Err(ProllyError::AlreadyClosed);
        }

        self.tx = None;
        match self.join_consumer() {
            Ok(map) => {
                self.result = Some(map);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// The built map. `None` until `close` has succeeded.
    pub fn get_map(&self) -> Option<&ProllyMap<N>> {
        self.result.as_ref()
    }

    /// Consumes the builder, returning the built map.
    pub fn into_map(mut self) -> Option<ProllyMap<N>> {
        self.result.take()
    }

    fn send(&mut self, value: Vec<u8>) -> std::result::Result<(), mpsc::SendError<Vec<u8>>> {
        match &self.tx {
            Some(tx) => tx.send(value),
            None => Err(mpsc::SendError(value)),
        }
    }

    fn consumer_error(&mut self) -> ProllyError {
        self.tx = None;
        match self.join_consumer() {
            Ok(_) => io::Error::new(
                io::ErrorKind::BrokenPipe,
                "map consumer exited before the stream was closed",
            )
            .into(),
            Err(err) => err,
        }
    }

    fn join_consumer(&mut self) -> Result<ProllyMap<N>> {
        match self.consumer.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Err(ProllyError::AlreadyClosed),
        }
    }

    /// Latches a terminal error, closing the stream.
    fn fail(&mut self, err: ProllyError) -> ProllyError {
        self.tx = None;
        let repeat = repeat_error(&err);
        self.failed = Some(err);
        repeat
    }
}

impl<const N: usize> Drop for StreamingMapBuilder<N> {
    fn drop(&mut self) {
        // Unblock and discard the consumer if the builder was abandoned
        // without close().
        self.tx = None;
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

/// Background half of the builder: pairs keys with values and feeds the
/// chunker until the channel closes.
fn consume<const N: usize>(
    store: SharedStore<N>,
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<ProllyMap<N>> {
    let mut chunker = SequenceChunker::new_empty(store, map_maker(), cancel.clone());
    loop {
        let Some(key) = recv_cancelable(&rx, &cancel)? else {
            break;
        };
        let Some(value) = recv_cancelable(&rx, &cancel)? else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "key/value stream ended between a key and its value",
            )
            .into());
        };
        chunker.append(SequenceItem::Entry(MapEntry { key, value }))?;
    }
    Ok(ProllyMap::from_sequence(chunker.done()?))
}

/// Reconstructs an equivalent error so a latched failure can be returned
/// from every subsequent call.
fn repeat_error(err: &ProllyError) -> ProllyError {
    match err {
        ProllyError::CrossDatabase => ProllyError::CrossDatabase,
        ProllyError::UnsortedInput => ProllyError::UnsortedInput,
        ProllyError::AlreadyClosed => ProllyError::AlreadyClosed,
        ProllyError::InvalidSeek(msg) => ProllyError::InvalidSeek(msg.clone()),
        ProllyError::InvalidCursor => ProllyError::InvalidCursor,
        ProllyError::Io(e) => ProllyError::Io(io::Error::new(e.kind(), e.to_string())),
        ProllyError::Serialization(e) => {
            ProllyError::Serialization(Box::new(bincode::ErrorKind::Custom(e.to_string())))
        }
        ProllyError::Canceled => ProllyError::Canceled,
    }
}
