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

use thiserror::Error;

/// Errors produced by the sequence engine.
///
/// Store failures and cancellation propagate out of every chunking
/// operation; no node is considered committed unless its write succeeded.
#[derive(Error, Debug)]
pub enum ProllyError {
    #[error("cannot splice sequences from different value stores")]
    CrossDatabase,

    #[error("input keys are not strictly increasing")]
    UnsortedInput,

    #[error("writer is already closed")]
    AlreadyClosed,

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    /// Navigation past the root or before the start of a sequence.
    /// Internal; escaping to a caller indicates a bug.
    #[error("cursor position out of bounds")]
    InvalidCursor,

    #[error("value store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("value encoding error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, ProllyError>;
