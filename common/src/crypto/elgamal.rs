// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! ElGamal over the group, plus the rewriting operations that let a party
//! transform a ciphertext without learning the plaintext: rerandomise,
//! reshuffle, rekey and their combination (RSK).
//!
//! A ciphertext carries the public key it is currently addressed to, so the
//! rewriting operations are self-contained.

use serde::{Deserialize, Serialize};
use tls_codec::{TlsDeserializeBytes, TlsSerialize, TlsSize};

use super::group::{GroupElement, GroupScalar};

/// Public half of an ElGamal key pair.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TlsSerialize, TlsDeserializeBytes,
    TlsSize,
)]
pub struct ElgamalPublicKey(GroupElement);

impl ElgamalPublicKey {
    pub fn element(&self) -> &GroupElement {
        &self.0
    }
}

impl From<GroupElement> for ElgamalPublicKey {
    fn from(element: GroupElement) -> Self {
        Self(element)
    }
}

/// Private half of an ElGamal key pair.
#[derive(Clone, Serialize, Deserialize)]
pub struct ElgamalPrivateKey(GroupScalar);

impl ElgamalPrivateKey {
    pub fn random() -> Self {
        Self(GroupScalar::random())
    }

    pub fn from_scalar(scalar: GroupScalar) -> Self {
        Self(scalar)
    }

    pub fn public_key(&self) -> ElgamalPublicKey {
        ElgamalPublicKey(GroupElement::base_mult(&self.0))
    }

    pub fn scalar(&self) -> &GroupScalar {
        &self.0
    }
}

impl std::fmt::Debug for ElgamalPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ElgamalPrivateKey([[REDACTED]])")
    }
}

/// An ElGamal ciphertext `(B, C)` together with the public key `Y` it is
/// addressed to: `B = b·G`, `C = M + b·Y`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, TlsSerialize, TlsDeserializeBytes,
    TlsSize,
)]
pub struct ElgamalCiphertext {
    b: GroupElement,
    c: GroupElement,
    y: ElgamalPublicKey,
}

impl ElgamalCiphertext {
    /// Encrypt `m` under `y` with fresh randomness.
    pub fn encrypt(m: &GroupElement, y: &ElgamalPublicKey) -> Self {
        let r = GroupScalar::random();
        Self {
            b: GroupElement::base_mult(&r),
            c: *m + y.0 * &r,
            y: *y,
        }
    }

    /// Recover the plaintext with the private key the ciphertext is
    /// addressed to.
    pub fn decrypt(&self, key: &ElgamalPrivateKey) -> GroupElement {
        self.c - self.b * key.scalar()
    }

    /// Fresh randomness, same plaintext, same public key.
    pub fn rerandomize(&self) -> Self {
        let r = GroupScalar::random();
        Self {
            b: self.b + GroupElement::base_mult(&r),
            c: self.c + self.y.0 * &r,
            y: self.y,
        }
    }

    /// Scale the plaintext by `s` without touching the key.
    pub fn reshuffle(&self, s: &GroupScalar) -> Self {
        Self {
            b: self.b * s,
            c: self.c * s,
            y: self.y,
        }
    }

    /// Change the recipient key from `Y` to `k·Y`. The plaintext is
    /// unchanged; only the holder of `k·y` can decrypt the result.
    ///
    /// Fails only for `k = 0`, which no derivation produces.
    pub fn rekey(&self, k: &GroupScalar) -> Result<Self, super::errors::GroupError> {
        let k_inv = k.invert()?;
        Ok(Self {
            b: self.b * &k_inv,
            c: self.c,
            y: ElgamalPublicKey(self.y.0 * k),
        })
    }

    /// Combined reshuffle + rekey + rerandomise in one step. This is the hop
    /// primitive of the transcryption protocol.
    pub fn rsk(&self, s: &GroupScalar, k: &GroupScalar) -> Result<Self, super::errors::GroupError> {
        let k_inv = k.invert()?;
        let r = GroupScalar::random();
        let y = ElgamalPublicKey(self.y.0 * k);
        Ok(Self {
            b: self.b * &(*s * k_inv) + GroupElement::base_mult(&r),
            c: self.c * s + y.0 * &r,
            y,
        })
    }

    /// The public key this ciphertext is currently addressed to.
    pub fn public_key(&self) -> &ElgamalPublicKey {
        &self.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (ElgamalPrivateKey, ElgamalPublicKey) {
        let sk = ElgamalPrivateKey::random();
        let pk = sk.public_key();
        (sk, pk)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let ct = ElgamalCiphertext::encrypt(&m, &pk);
        assert_eq!(ct.decrypt(&sk), m);
    }

    #[test]
    fn rerandomize_preserves_plaintext() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let ct = ElgamalCiphertext::encrypt(&m, &pk);
        let rr = ct.rerandomize();
        assert_ne!(ct, rr);
        assert_eq!(rr.decrypt(&sk), m);
    }

    #[test]
    fn reshuffle_scales_plaintext() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let s = GroupScalar::random();
        let ct = ElgamalCiphertext::encrypt(&m, &pk).reshuffle(&s);
        assert_eq!(ct.decrypt(&sk), m * &s);
    }

    #[test]
    fn rekey_changes_recipient() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let k = GroupScalar::random();
        let ct = ElgamalCiphertext::encrypt(&m, &pk).rekey(&k).unwrap();
        let new_key = ElgamalPrivateKey::from_scalar(*sk.scalar() * k);
        assert_eq!(ct.decrypt(&new_key), m);
    }

    #[test]
    fn rsk_combines_reshuffle_rekey_rerandomize() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let (s, k) = (GroupScalar::random(), GroupScalar::random());
        let ct = ElgamalCiphertext::encrypt(&m, &pk).rsk(&s, &k).unwrap();
        let new_key = ElgamalPrivateKey::from_scalar(*sk.scalar() * k);
        assert_eq!(ct.decrypt(&new_key), m * &s);
    }

    #[test]
    fn rsk_composes() {
        let (sk, pk) = keypair();
        let m = GroupElement::hash(b"message");
        let (s1, k1) = (GroupScalar::random(), GroupScalar::random());
        let (s2, k2) = (GroupScalar::random(), GroupScalar::random());

        let chained = ElgamalCiphertext::encrypt(&m, &pk)
            .rsk(&s1, &k1)
            .unwrap()
            .rsk(&s2, &k2)
            .unwrap();
        let composed_key = ElgamalPrivateKey::from_scalar(*sk.scalar() * k1 * k2);
        assert_eq!(chained.decrypt(&composed_key), m * &(s1 * s2));
    }
}
