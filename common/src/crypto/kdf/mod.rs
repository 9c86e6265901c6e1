// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key derivation. Every derived value is labelled and its derivation
//! context is length-delimited, so no two derivations can collide.

use hkdf::Hkdf;

use crate::LibraryError;

use super::{Hash, secrets::Secret};

/// This type determines the KDF used by the protocol.
pub type Kdf = Hkdf<Hash>;
pub const KDF_KEY_SIZE: usize = 32;

const KDF_LABEL_PREFIX: &str = "morpho kdf";

fn kdf_info(label: &str, context: &[&[u8]]) -> Vec<u8> {
    let mut info = Vec::new();
    info.extend_from_slice(KDF_LABEL_PREFIX.as_bytes());
    info.extend_from_slice((label.len() as u64).to_be_bytes().as_slice());
    info.extend_from_slice(label.as_bytes());
    for part in context {
        info.extend_from_slice((part.len() as u64).to_be_bytes().as_slice());
        info.extend_from_slice(part);
    }
    info
}

/// Expand `ikm` into `OUT` bytes under the given label and context.
pub fn expand<const OUT: usize>(
    ikm: &[u8],
    label: &str,
    context: &[&[u8]],
) -> Result<[u8; OUT], LibraryError> {
    let kdf = Kdf::new(None, ikm);
    let mut out = [0u8; OUT];
    kdf.expand(&kdf_info(label, context), &mut out)
        .map_err(|_| LibraryError {})?;
    Ok(out)
}

/// A value derivable from input key material under a fixed label.
pub trait KdfDerivable: From<Secret<KDF_KEY_SIZE>> {
    const LABEL: &'static str;

    fn derive(ikm: &[u8], context: &[&[u8]]) -> Result<Self, LibraryError> {
        let okm: [u8; KDF_KEY_SIZE] = expand(ikm, Self::LABEL, context)?;
        Ok(Secret::from(okm).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_parts_do_not_collide() {
        let a: [u8; 32] = expand(b"ikm", "test", &[b"ab", b"c"]).unwrap();
        let b: [u8; 32] = expand(b"ikm", "test", &[b"a", b"bc"]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn labels_do_not_collide() {
        let a: [u8; 32] = expand(b"ikm", "one", &[]).unwrap();
        let b: [u8; 32] = expand(b"ikm", "two", &[]).unwrap();
        assert_ne!(a, b);
    }
}
