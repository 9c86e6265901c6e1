// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use sha2::{Digest, Sha256};

/// This type determines the hash function used throughout the protocol.
pub type Hash = Sha256;

pub const HASH_SIZE: usize = 32;

/// Domain-separated hash over a sequence of length-delimited parts. Used
/// wherever two implementations must agree on a digest over structured input
/// (record checksums, bound-extra digests).
pub fn hash_parts(domain: &str, parts: &[&[u8]]) -> [u8; HASH_SIZE] {
    let mut hasher = Hash::new();
    hasher.update((domain.len() as u64).to_be_bytes());
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_are_length_delimited() {
        // Shifting a byte between adjacent parts must change the digest.
        let a = hash_parts("test", &[b"ab", b"c"]);
        let b = hash_parts("test", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn domain_separation() {
        assert_ne!(hash_parts("one", &[b"x"]), hash_parts("two", &[b"x"]));
    }
}
