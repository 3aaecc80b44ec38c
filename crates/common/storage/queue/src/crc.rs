// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crc32fast::Hasher;

/// CRC32 over an encoded page body (header and records).
#[inline]
pub(crate) fn page_checksum(body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_checksum() {
        let body = b"SPLP\x01\x01\x00\x00\x00";
        let crc = page_checksum(body);

        // Same input produces same CRC
        assert_eq!(crc, page_checksum(body));

        // A single flipped bit changes it
        let mut flipped = body.to_vec();
        flipped[5] ^= 0x01;
        assert_ne!(crc, page_checksum(&flipped));
    }
}
