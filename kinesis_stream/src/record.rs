//! Records handed to consumers and the deserializers that produce their payloads.
use std::{fmt, marker::PhantomData};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::kcl::{BoxError, EncryptionType, ExtendedSequenceNumber, KinesisClientRecord};

/// A record of a shard with its payload deserialized.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub shard_id: String,
    pub sequence_number: String,
    /// Only set for records unpacked from an aggregated record.
    pub sub_sequence_number: Option<u64>,
    pub approximate_arrival_timestamp: DateTime<Utc>,
    pub data: T,
    pub partition_key: String,
    pub encryption_type: EncryptionType,
    pub explicit_hash_key: Option<String>,
    pub aggregated: bool,
}

impl<T> Record<T> {
    pub(crate) fn new(shard_id: &str, raw: KinesisClientRecord, data: T) -> Self {
        Self {
            shard_id: shard_id.to_string(),
            sequence_number: raw.sequence_number,
            sub_sequence_number: (raw.sub_sequence_number != 0).then_some(raw.sub_sequence_number),
            approximate_arrival_timestamp: raw.approximate_arrival_timestamp,
            data,
            partition_key: raw.partition_key,
            encryption_type: raw.encryption_type,
            explicit_hash_key: (!raw.explicit_hash_key.is_empty()).then_some(raw.explicit_hash_key),
            aggregated: raw.aggregated,
        }
    }

    pub fn extended_sequence_number(&self) -> ExtendedSequenceNumber {
        ExtendedSequenceNumber::new(self.sequence_number.clone(), self.sub_sequence_number)
    }
}

/// Turns a raw record payload into the consumer's type.
pub trait RecordDeserializer<T>: fmt::Debug + Send + Sync + 'static {
    fn deserialize(&self, data: &Bytes) -> Result<T, BoxError>;
}

/// Hands out the raw payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDeserializer;

impl RecordDeserializer<Bytes> for BytesDeserializer {
    fn deserialize(&self, data: &Bytes) -> Result<Bytes, BoxError> {
        Ok(data.clone())
    }
}

/// Payloads are UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Deserializer;

impl RecordDeserializer<String> for Utf8Deserializer {
    fn deserialize(&self, data: &Bytes) -> Result<String, BoxError> {
        Ok(std::str::from_utf8(data)?.to_string())
    }
}

/// Payloads are JSON documents of `T`.
pub struct JsonDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDeserializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDeserializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonDeserializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonDeserializer")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> RecordDeserializer<T> for JsonDeserializer<T>
where
    T: DeserializeOwned + 'static,
{
    fn deserialize(&self, data: &Bytes) -> Result<T, BoxError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn raw(sub_sequence_number: u64, explicit_hash_key: &str) -> KinesisClientRecord {
        KinesisClientRecord {
            sequence_number: "4959".to_string(),
            sub_sequence_number,
            approximate_arrival_timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            data: Bytes::from_static(br#"{"user":"ada","clicks":3}"#),
            partition_key: "ada".to_string(),
            encryption_type: EncryptionType::Kms,
            explicit_hash_key: explicit_hash_key.to_string(),
            aggregated: sub_sequence_number != 0,
        }
    }

    #[test]
    fn test_optional_fields_only_when_set() {
        let record = Record::new("shard-0", raw(0, ""), ());
        assert_eq!(record.sub_sequence_number, None);
        assert_eq!(record.explicit_hash_key, None);
        assert_eq!(
            record.extended_sequence_number(),
            ExtendedSequenceNumber::new("4959", None)
        );

        let record = Record::new("shard-0", raw(2, "1234"), ());
        assert_eq!(record.shard_id, "shard-0");
        assert_eq!(record.sub_sequence_number, Some(2));
        assert_eq!(record.explicit_hash_key.as_deref(), Some("1234"));
        assert_eq!(record.encryption_type, EncryptionType::Kms);
        assert!(record.aggregated);
    }

    #[test]
    fn test_deserializers() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Clicks {
            user: String,
            clicks: u32,
        }

        let data = raw(0, "").data;
        assert_eq!(BytesDeserializer.deserialize(&data).unwrap(), data);
        assert_eq!(
            Utf8Deserializer.deserialize(&data).unwrap(),
            r#"{"user":"ada","clicks":3}"#
        );
        assert_eq!(
            JsonDeserializer::<Clicks>::new().deserialize(&data).unwrap(),
            Clicks {
                user: "ada".to_string(),
                clicks: 3
            }
        );

        let garbage = Bytes::from_static(&[0xff, 0xfe]);
        assert!(Utf8Deserializer.deserialize(&garbage).is_err());
        assert!(JsonDeserializer::<Clicks>::new().deserialize(&garbage).is_err());
    }
}
