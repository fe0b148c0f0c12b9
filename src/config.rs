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
use serde::{Deserialize, Serialize};

/// Rolling-hash parameters that determine chunk boundaries.
///
/// Tree shape is a pure function of item contents and these parameters, so
/// every sequence stored in one value store must be chunked with the same
/// configuration; it travels with the store's [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Boundary mask. A boundary occurs when `hash & pattern == pattern`,
    /// so a pattern of `(1 << B) - 1` yields an expected chunk size of
    /// `2^B` bytes with a geometric tail.
    pub pattern: u32,
    /// Rolling window width in bytes.
    pub window: u32,
    /// Boundaries are suppressed until this many bytes have been hashed
    /// since the last boundary.
    pub min_chunk_size: usize,
    /// A boundary is forced once this many bytes have been hashed since
    /// the last boundary.
    pub max_chunk_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            pattern: (1 << 12) - 1,
            window: 64,
            min_chunk_size: 64,
            max_chunk_size: 64 * 1024,
        }
    }
}

/// Serialization format descriptor exposed by a value store.
///
/// Determines how items are hashed for boundary detection and how ordered
/// keys compare. Sequences may only be spliced together when their stores
/// report the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Format {
    chunk: ChunkConfig,
}

impl Format {
    pub fn new(chunk: ChunkConfig) -> Self {
        Format { chunk }
    }

    pub fn chunk(&self) -> ChunkConfig {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern_targets_4k_chunks() {
        let config = ChunkConfig::default();
        assert_eq!(config.pattern, 0xFFF);
        assert!(config.min_chunk_size < config.max_chunk_size);
    }

    #[test]
    fn test_format_carries_chunk_config() {
        let config = ChunkConfig {
            pattern: (1 << 6) - 1,
            window: 16,
            min_chunk_size: 1,
            max_chunk_size: 1 << 14,
        };
        let format = Format::new(config);
        assert_eq!(format.chunk(), config);
    }
}
