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

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A fixed-size content hash identifying a persisted sequence node.
///
/// Nodes are immutable and addressed by the hash of their canonical
/// encoding, so two independently built nodes with the same contents share
/// one `ValueDigest`. The constant parameter `N` is the number of hash
/// bytes retained, typically 32 for SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueDigest<const N: usize>([u8; N]);

impl<const N: usize> ValueDigest<N> {
    /// Computes the digest of `data`.
    pub fn new(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();

        let mut hash = [0u8; N];
        hash.copy_from_slice(&result[..N]);
        ValueDigest(hash)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> fmt::Display for ValueDigest<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// serde's derived array impls stop at fixed small sizes, so digests encode
// themselves as plain byte strings.
impl<const N: usize> Serialize for ValueDigest<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for ValueDigest<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        let hash: [u8; N] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::invalid_length(b.len(), &"digest byte string"))?;
        Ok(ValueDigest(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_value_digest_new() {
        let data = b"test data";
        let expected_hash = {
            let mut hasher = Sha256::new();
            hasher.update(data);
            let result = hasher.finalize();
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&result[..32]);
            hash
        };

        let value_digest = ValueDigest::<32>::new(data);
        assert_eq!(value_digest.as_bytes(), &expected_hash);
    }

    #[test]
    fn test_value_digest_equality() {
        let digest1 = ValueDigest::<32>::new(b"test data 1");
        let digest2 = ValueDigest::<32>::new(b"test data 1");
        let digest3 = ValueDigest::<32>::new(b"test data 2");

        assert_eq!(digest1, digest2);
        assert_ne!(digest1, digest3);
    }

    #[test]
    fn test_value_digest_display_is_hex() {
        let digest = ValueDigest::<32>::new(b"test data");
        let text = digest.to_string();

        assert_eq!(text.len(), 64);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_value_digest_serde_round_trip() {
        let digest = ValueDigest::<32>::new(b"test data");
        let encoded = bincode::serialize(&digest).unwrap();
        let decoded: ValueDigest<32> = bincode::deserialize(&encoded).unwrap();

        assert_eq!(digest, decoded);
    }
}
