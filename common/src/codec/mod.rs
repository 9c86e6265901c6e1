// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Versioned serialization of persisted and transferred values. The first
//! byte of every encoding names the codec version, the remainder is the
//! codec-specific body (CBOR for the current version). [`CodecBlob`] stores
//! codec-encoded values in BLOB columns.

use serde::{Serialize, de::DeserializeOwned};
use sqlx::{Database, Decode, Encode, Type, encode::IsNull, error::BoxDynError};
use thiserror::Error;

/// Codec failures name the failing direction and carry the underlying
/// reason, so a bad row or frame can be pinpointed from the log alone.
#[derive(Debug, Error)]
pub enum Error {
    /// The input ended before the version byte.
    #[error("empty encoding")]
    EmptyInput,
    /// The leading byte names no known codec version.
    #[error("unsupported codec version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("value does not encode: {0}")]
    Serialize(String),
    #[error("encoding does not decode: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[non_exhaustive]
pub enum MorphoCodec {
    #[default]
    V1 = 1,
}

impl MorphoCodec {
    fn from_version_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            1 => Ok(MorphoCodec::V1),
            unknown => Err(Error::UnsupportedVersion(unknown)),
        }
    }

    fn serialize<T: Sized + Serialize>(&self, value: &T) -> Result<Vec<u8>, Error> {
        // The first byte is always the codec version.
        let mut buf = vec![*self as u8];
        match self {
            MorphoCodec::V1 => ciborium::ser::into_writer(value, &mut buf)
                .map_err(|error| Error::Serialize(error.to_string()))?,
        }
        Ok(buf)
    }

    fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, Error> {
        match self {
            MorphoCodec::V1 => ciborium::de::from_reader(body)
                .map_err(|error| Error::Deserialize(error.to_string())),
        }
    }
}

/// Serialize `value` with the default codec version.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    MorphoCodec::default().serialize(value)
}

/// Deserialize a value previously encoded with [`to_vec`], honouring the
/// version byte of the encoding.
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    let (version_byte, body) = bytes.split_first().ok_or(Error::EmptyInput)?;
    MorphoCodec::from_version_byte(*version_byte)?.deserialize(body)
}

/// Wrapper carrying a value through a BLOB column in its codec encoding.
/// Wrap on bind, unwrap with [`CodecBlob::into_inner`] after a fetch.
pub struct CodecBlob<T>(pub T);

impl<T> CodecBlob<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<DB: Database, T> Type<DB> for CodecBlob<T>
where
    Vec<u8>: Type<DB>,
{
    fn type_info() -> <DB as Database>::TypeInfo {
        Vec::<u8>::type_info()
    }
}

impl<'q, DB: Database, T: Serialize> Encode<'q, DB> for CodecBlob<T>
where
    Vec<u8>: Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        let bytes = to_vec(&self.0)?;
        Encode::<DB>::encode(bytes, buf)
    }
}

impl<'r, DB: Database, T: DeserializeOwned> Decode<'r, DB> for CodecBlob<T>
where
    &'r [u8]: Decode<'r, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let bytes: &[u8] = Decode::<DB>::decode(value)?;
        from_slice(bytes).map(CodecBlob).map_err(From::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let value = (42u64, "forty-two".to_string(), vec![4u8, 2]);
        let bytes = to_vec(&value).unwrap();
        assert_eq!(bytes[0], MorphoCodec::V1 as u8);
        let decoded: (u64, String, Vec<u8>) = from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = [0xff, 0x00];
        assert!(matches!(
            from_slice::<u64>(&bytes),
            Err(Error::UnsupportedVersion(0xff))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(from_slice::<u64>(&[]), Err(Error::EmptyInput)));
    }

    #[test]
    fn garbled_body_reports_the_decode_direction() {
        let bytes = [MorphoCodec::V1 as u8, 0xff, 0xff];
        assert!(matches!(
            from_slice::<String>(&bytes),
            Err(Error::Deserialize(_))
        ));
    }
}
