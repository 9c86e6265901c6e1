// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Constant-time arithmetic on the Ristretto prime-order group over
//! Curve25519 and its scalar field. Everything above this module treats the
//! group abstractly through [`GroupElement`] and [`GroupScalar`].

use curve25519_dalek::{
    RistrettoPoint, Scalar,
    constants::RISTRETTO_BASEPOINT_TABLE,
    ristretto::{CompressedRistretto, RistrettoBasepointTable},
    traits::{Identity, VartimeMultiscalarMul},
};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tls_codec::{DeserializeBytes as TlsDeserializeBytesTrait, Serialize as TlsSerializeTrait, Size};

use super::errors::GroupError;

pub const GROUP_ELEMENT_SIZE: usize = 32;
pub const SCALAR_SIZE: usize = 32;

/// An element of the scalar field of the group. Values are always reduced
/// modulo the group order.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupScalar(Scalar);

impl GroupScalar {
    pub const ONE: GroupScalar = GroupScalar(Scalar::ONE);

    /// Sample a uniformly random scalar from the process CSPRNG.
    pub fn random() -> Self {
        Self(Scalar::random(&mut rand::rngs::OsRng))
    }

    /// Reduce 64 uniformly random bytes modulo the group order.
    pub fn from_wide_bytes(bytes: &[u8; 64]) -> Self {
        Self(Scalar::from_bytes_mod_order_wide(bytes))
    }

    /// Parse a canonical 32-byte scalar encoding.
    pub fn unpack(bytes: &[u8; 32]) -> Result<Self, GroupError> {
        Option::from(Scalar::from_canonical_bytes(*bytes))
            .map(Self)
            .ok_or(GroupError::InvalidEncoding)
    }

    pub fn pack(&self) -> [u8; SCALAR_SIZE] {
        self.0.to_bytes()
    }

    /// Multiplicative inverse. Defined only for non-zero scalars.
    pub fn invert(&self) -> Result<Self, GroupError> {
        if self.0 == Scalar::ZERO {
            return Err(GroupError::NonInvertibleScalar);
        }
        Ok(Self(self.0.invert()))
    }

    pub fn square(&self) -> Self {
        Self(self.0 * self.0)
    }
}

impl std::ops::Add for GroupScalar {
    type Output = GroupScalar;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::Mul for GroupScalar {
    type Output = GroupScalar;

    fn mul(self, rhs: Self) -> Self::Output {
        Self(self.0 * rhs.0)
    }
}

// Scalars are usually secret; keep them out of debug output.
impl std::fmt::Debug for GroupScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupScalar([[REDACTED]])")
    }
}

/// An element of the prime-order group.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupElement(RistrettoPoint);

impl GroupElement {
    pub fn identity() -> Self {
        Self(RistrettoPoint::identity())
    }

    /// `s·G` in constant time. Use for secret scalars.
    pub fn base_mult(s: &GroupScalar) -> Self {
        Self(RISTRETTO_BASEPOINT_TABLE * &s.0)
    }

    /// `s·G` in variable time. The caller asserts that `s` is public.
    pub fn public_base_mult(s: &GroupScalar) -> Self {
        Self(RistrettoPoint::vartime_multiscalar_mul(
            std::iter::once(&s.0),
            std::iter::once(&curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT),
        ))
    }

    /// Map arbitrary bytes to a group element (Elligator). The output is
    /// computationally indistinguishable from uniform.
    pub fn hash(bytes: &[u8]) -> Self {
        Self(RistrettoPoint::hash_from_bytes::<Sha512>(bytes))
    }

    /// The canonical 32-byte encoding of this element.
    pub fn pack(&self) -> [u8; GROUP_ELEMENT_SIZE] {
        self.0.compress().to_bytes()
    }

    /// Parse a canonical 32-byte encoding. Fails on non-canonical input.
    pub fn unpack(bytes: &[u8; GROUP_ELEMENT_SIZE]) -> Result<Self, GroupError> {
        CompressedRistretto(*bytes)
            .decompress()
            .map(Self)
            .ok_or(GroupError::InvalidEncoding)
    }

    pub fn unpack_slice(bytes: &[u8]) -> Result<Self, GroupError> {
        let bytes: &[u8; GROUP_ELEMENT_SIZE] =
            bytes.try_into().map_err(|_| GroupError::InvalidEncoding)?;
        Self::unpack(bytes)
    }
}

impl std::ops::Add for GroupElement {
    type Output = GroupElement;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl std::ops::Sub for GroupElement {
    type Output = GroupElement;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl std::ops::Mul<&GroupScalar> for GroupElement {
    type Output = GroupElement;

    fn mul(self, rhs: &GroupScalar) -> Self::Output {
        Self(self.0 * rhs.0)
    }
}

impl std::fmt::Debug for GroupElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupElement({})", hex::encode(self.pack()))
    }
}

impl Size for GroupElement {
    fn tls_serialized_len(&self) -> usize {
        GROUP_ELEMENT_SIZE
    }
}

impl TlsSerializeTrait for GroupElement {
    fn tls_serialize<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, tls_codec::Error> {
        writer.write_all(&self.pack())?;
        Ok(GROUP_ELEMENT_SIZE)
    }
}

impl TlsDeserializeBytesTrait for GroupElement {
    fn tls_deserialize_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), tls_codec::Error>
    where
        Self: Sized,
    {
        let encoding: &[u8; GROUP_ELEMENT_SIZE] = bytes
            .get(..GROUP_ELEMENT_SIZE)
            .ok_or(tls_codec::Error::EndOfStream)?
            .try_into()
            .map_err(|_| tls_codec::Error::EndOfStream)?;
        let element =
            Self::unpack(encoding).map_err(|_| tls_codec::Error::InvalidInput)?;
        Ok((element, &bytes[GROUP_ELEMENT_SIZE..]))
    }
}

/// Precomputed table for repeated constant-time multiplication with the same
/// base. Constructing the table costs roughly one base-point multiplication
/// and is amortised across many multiplications.
pub struct ScalarMultTable {
    table: RistrettoBasepointTable,
}

impl ScalarMultTable {
    pub fn new(base: &GroupElement) -> Self {
        Self {
            table: RistrettoBasepointTable::create(&base.0),
        }
    }

    pub fn mult(&self, s: &GroupScalar) -> GroupElement {
        GroupElement(&self.table * &s.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_inversion() {
        let s = GroupScalar::random();
        let inv = s.invert().unwrap();
        assert_eq!(s * inv, GroupScalar::ONE);
    }

    #[test]
    fn zero_scalar_is_not_invertible() {
        let zero = GroupScalar::from_wide_bytes(&[0u8; 64]);
        assert_eq!(zero.invert(), Err(GroupError::NonInvertibleScalar));
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let s = GroupScalar::random();
        let p = GroupElement::base_mult(&s);
        let packed = p.pack();
        let unpacked = GroupElement::unpack(&packed).unwrap();
        assert_eq!(p, unpacked);
    }

    #[test]
    fn non_canonical_encoding_fails() {
        // All-ones is not a valid Ristretto encoding.
        let bytes = [0xffu8; GROUP_ELEMENT_SIZE];
        assert_eq!(
            GroupElement::unpack(&bytes),
            Err(GroupError::InvalidEncoding)
        );
    }

    #[test]
    fn public_base_mult_matches_base_mult() {
        let s = GroupScalar::random();
        assert_eq!(
            GroupElement::base_mult(&s),
            GroupElement::public_base_mult(&s)
        );
    }

    #[test]
    fn hash_is_deterministic_and_spread() {
        let a = GroupElement::hash(b"participant-a");
        let b = GroupElement::hash(b"participant-b");
        assert_eq!(a, GroupElement::hash(b"participant-a"));
        assert_ne!(a, b);
    }

    #[test]
    fn scalar_mult_table_matches_direct_mult() {
        let base = GroupElement::hash(b"table-base");
        let table = ScalarMultTable::new(&base);
        let s = GroupScalar::random();
        assert_eq!(table.mult(&s), base * &s);
    }
}
