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

use crate::config::ChunkConfig;

/// Per-byte mixing table for the cyclic-polynomial (buzhash) rolling hash.
/// Generated deterministically so boundary decisions are stable across
/// builds and platforms.
static BUZ_TABLE: [u32; 256] = build_buz_table();

const fn build_buz_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state: u32 = 0x9E37_79B9;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let mut z = state;
        z ^= z >> 16;
        z = z.wrapping_mul(0x85EB_CA6B);
        z ^= z >> 13;
        z = z.wrapping_mul(0xC2B2_AE35);
        z ^= z >> 16;
        table[i] = z;
        i += 1;
    }
    table
}

/// Windowed rolling hash deciding chunk boundaries.
///
/// State is a pure function of the bytes hashed since the last `reset`, so
/// two streams with identical contents produce identical boundaries. Each
/// byte is salted with the chunker level, giving every tree level an
/// independent boundary distribution. Once a boundary is crossed further
/// bytes are ignored until the hasher is reset.
#[derive(Debug)]
pub struct RollingValueHasher {
    ring: Vec<u8>,
    next: usize,
    sum: u32,
    bytes_hashed: usize,
    pub crossed_boundary: bool,
    pattern: u32,
    window: usize,
    rotation: u32,
    min_size: usize,
    max_size: usize,
    salt: u8,
}

impl RollingValueHasher {
    pub fn new(config: ChunkConfig, salt: u8) -> Self {
        let window = config.window.max(1) as usize;
        RollingValueHasher {
            ring: Vec::with_capacity(window),
            next: 0,
            sum: 0,
            bytes_hashed: 0,
            crossed_boundary: false,
            pattern: config.pattern,
            window,
            rotation: (window as u32) % 32,
            min_size: config.min_chunk_size,
            max_size: config.max_chunk_size,
            salt,
        }
    }

    /// Hashes one byte and reports whether a chunk boundary has been
    /// crossed since the last reset.
    pub fn hash_byte(&mut self, b: u8) -> bool {
        if self.crossed_boundary {
            return true;
        }

        let b = b ^ self.salt;
        if self.ring.len() < self.window {
            self.sum = self.sum.rotate_left(1) ^ BUZ_TABLE[b as usize];
            self.ring.push(b);
        } else {
            let out = self.ring[self.next];
            self.sum = self.sum.rotate_left(1)
                ^ BUZ_TABLE[out as usize].rotate_left(self.rotation)
                ^ BUZ_TABLE[b as usize];
            self.ring[self.next] = b;
            self.next = (self.next + 1) % self.window;
        }

        self.bytes_hashed += 1;
        let pattern_hit = self.sum & self.pattern == self.pattern;
        self.crossed_boundary = (pattern_hit && self.bytes_hashed >= self.min_size)
            || self.bytes_hashed >= self.max_size;
        self.crossed_boundary
    }

    /// Hashes a run of bytes, stopping early once a boundary is crossed.
    pub fn hash_bytes(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if self.hash_byte(b) {
                break;
            }
        }
        self.crossed_boundary
    }

    /// Clears all state. Called after each emitted chunk.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.next = 0;
        self.sum = 0;
        self.bytes_hashed = 0;
        self.crossed_boundary = false;
    }
}
