// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Database, Decode, Encode, Type, encode::IsNull, error::BoxDynError};
use tls_codec::{
    DeserializeBytes as TlsDeserializeBytesTrait, Serialize as TlsSerializeTrait, Size,
};

pub use chrono::Duration;

/// Millisecond-precision point in time. All protocol timestamps (ledger rows,
/// ticket issuance, token claims) use this representation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeStamp {
    time: DateTime<Utc>,
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Size for TimeStamp {
    fn tls_serialized_len(&self) -> usize {
        8
    }
}

impl TlsSerializeTrait for TimeStamp {
    fn tls_serialize<W: std::io::Write>(&self, writer: &mut W) -> Result<usize, tls_codec::Error> {
        self.time
            .timestamp_millis()
            .to_be_bytes()
            .tls_serialize(writer)
    }
}

impl TlsDeserializeBytesTrait for TimeStamp {
    fn tls_deserialize_bytes(bytes: &[u8]) -> Result<(Self, &[u8]), tls_codec::Error>
    where
        Self: Sized,
    {
        let millis_bytes: [u8; 8] = bytes
            .get(..8)
            .ok_or(tls_codec::Error::EndOfStream)?
            .try_into()
            .map_err(|_| tls_codec::Error::EndOfStream)?;
        let millis = i64::from_be_bytes(millis_bytes);
        let time = DateTime::from_timestamp_millis(millis).ok_or(tls_codec::Error::InvalidInput)?;
        Ok((Self { time }, &bytes[8..]))
    }
}

impl TimeStamp {
    pub fn now() -> Self {
        let time = Utc::now();
        Self { time }
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(|time| Self { time })
    }

    pub fn as_millis(&self) -> i64 {
        self.time.timestamp_millis()
    }

    pub fn in_days(days_in_the_future: i64) -> Self {
        let time = Utc::now() + Duration::days(days_in_the_future);
        Self { time }
    }

    pub fn is_between(&self, start: &Self, end: &Self) -> bool {
        self.time >= start.time && self.time <= end.time
    }

    pub fn is_more_recent_than(&self, other: &Self) -> bool {
        self.time > other.time
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

impl std::ops::Add<Duration> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self {
            time: self.time + rhs,
        }
    }
}

impl<DB: Database> Type<DB> for TimeStamp
where
    i64: Type<DB>,
{
    fn type_info() -> DB::TypeInfo {
        <i64 as Type<DB>>::type_info()
    }
}

impl<'q, DB: Database> Encode<'q, DB> for TimeStamp
where
    i64: Encode<'q, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        Encode::<DB>::encode(self.as_millis(), buf)
    }
}

impl<'r, DB: Database> Decode<'r, DB> for TimeStamp
where
    i64: Decode<'r, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let millis: i64 = Decode::<DB>::decode(value)?;
        TimeStamp::from_millis(millis).ok_or_else(|| "timestamp out of range".into())
    }
}

/// Validity window of a signed artifact (ticket, token).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationData {
    not_before: TimeStamp,
    not_after: TimeStamp,
}

impl ExpirationData {
    /// Create a new instance of [`ExpirationData`] whose validity starts now
    /// and ends `lifetime` from now.
    pub fn new(lifetime: Duration) -> Self {
        let not_before = TimeStamp::now();
        Self {
            not_before,
            not_after: not_before + lifetime,
        }
    }

    pub fn from_start(not_before: TimeStamp, lifetime: Duration) -> Self {
        Self {
            not_before,
            not_after: not_before + lifetime,
        }
    }

    pub fn not_before(&self) -> TimeStamp {
        self.not_before
    }

    pub fn not_after(&self) -> TimeStamp {
        self.not_after
    }

    /// Return false either if the `not_after` date has passed, or if the
    /// `not_before` date has not passed yet.
    pub fn validate(&self) -> bool {
        let now = TimeStamp::now();
        now.is_between(&self.not_before, &self.not_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_roundtrip() {
        let ts = TimeStamp::now();
        let bytes = ts.tls_serialize_detached().unwrap();
        let (decoded, rest) = TimeStamp::tls_deserialize_bytes(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.as_millis(), ts.as_millis());
    }

    #[test]
    fn expiration_window() {
        let valid = ExpirationData::new(Duration::hours(1));
        assert!(valid.validate());

        let expired = ExpirationData {
            not_before: TimeStamp::now() + Duration::hours(-2),
            not_after: TimeStamp::now() + Duration::hours(-1),
        };
        assert!(!expired.validate());

        let not_yet = ExpirationData {
            not_before: TimeStamp::now() + Duration::hours(1),
            not_after: TimeStamp::now() + Duration::hours(2),
        };
        assert!(!not_yet.validate());
    }
}
