// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use sha2::{Digest, Sha384};

/// Maximum size of a single blob in bytes.
pub const MAX_BLOB_SIZE: u64 = 2 * (1 << 20);

/// Length of a hex-encoded SHA-384 digest.
pub const BLOBHASH_LENGTH: usize = 96;

/// Checks whether `blobhash` is the correct length and contains only
/// lowercase hex characters.
pub fn is_valid_blobhash(blobhash: &str) -> bool {
    blobhash.len() == BLOBHASH_LENGTH
        && blobhash
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Returns a fresh incremental blob hasher.
pub fn blob_hasher() -> Sha384 {
    Sha384::new()
}

/// Hex-encoded SHA-384 digest of `bytes`.
pub fn hash_blob_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha384::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_blobhash() {
        let valid = "a".repeat(BLOBHASH_LENGTH);
        assert!(is_valid_blobhash(&valid));
        assert!(is_valid_blobhash(&"0123456789abcdef".repeat(6)));
    }

    #[test]
    fn test_invalid_blobhash() {
        assert!(!is_valid_blobhash(""));
        assert!(!is_valid_blobhash(&"a".repeat(BLOBHASH_LENGTH - 1)));
        assert!(!is_valid_blobhash(&"a".repeat(BLOBHASH_LENGTH + 1)));
        // uppercase and non-hex characters are rejected
        assert!(!is_valid_blobhash(&"A".repeat(BLOBHASH_LENGTH)));
        assert!(!is_valid_blobhash(&"g".repeat(BLOBHASH_LENGTH)));
        let mut with_space = "a".repeat(BLOBHASH_LENGTH - 1);
        with_space.push(' ');
        assert!(!is_valid_blobhash(&with_space));
    }

    #[test]
    fn test_hash_blob_bytes_length() {
        assert_eq!(hash_blob_bytes(b"").len(), BLOBHASH_LENGTH);
        assert!(is_valid_blobhash(&hash_blob_bytes(b"nalu")));
    }
}
