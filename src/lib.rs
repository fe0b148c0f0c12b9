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

//! # prollyseq
//!
//! A probabilistic B-tree ("prolly tree") sequence engine backing a
//! content-addressed, immutable value store. Large ordered byte sequences
//! (blobs) and large ordered key/value maps are represented as balanced,
//! content-defined trees whose shape is a deterministic function of their
//! contents, not of their construction history. That determinism is what
//! makes structural sharing, cheap diffing, and stable hash identity work
//! across independently built sequences.
//!
//! ## How a tree is built
//!
//! Items stream through a rolling hash ([`rolling::RollingValueHasher`]);
//! wherever the hash reports a boundary, the accumulated run becomes a
//! persisted node and its meta-tuple is handed one level up. The linked
//! chain of per-level builders ([`chunker::SequenceChunker`]) grows lazily
//! until the stream ends and the tower collapses to a canonical root.
//! A chunker can also resume from a cursor into an existing tree, which is
//! how in-place edits and [`blob::Blob::concat`] splice trees while
//! rewriting only the touched spines.
//!
//! ## Surfaces
//!
//! - [`blob::Blob`]: random-access bytes with a streaming reader,
//!   read-ahead copy, and parallel construction from multiple readers.
//! - [`map::ProllyMap`]: an ordered map with lookup and in-order
//!   iteration, built in bulk or streamed through
//!   [`map_builder::StreamingMapBuilder`].
//! - [`store::ValueStore`]: the content-addressed persistence the engine
//!   writes nodes through; in-memory and file-backed stores are included.

pub mod blob;
pub mod cancel;
pub mod chunker;
mod concat;
pub mod config;
pub mod cursor;
pub mod digest;
pub mod errors;
pub mod map;
pub mod map_builder;
pub mod node;
pub mod rolling;
pub mod store;
