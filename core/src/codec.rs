//! Payload decoding.
//!
//! Decoders are pure: the same record always decodes to the same result and
//! nothing is logged or committed here. Whether a failure is retried,
//! dead-lettered or surfaced is decided by the caller.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::DecodeError;
use crate::record::Record;

/// Header carrying the producer's type tag for the payload.
pub const TYPE_ID_HEADER: &str = "__TypeId__";

/// A successfully decoded value together with the record it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    pub value: T,
    pub record: Record,
}

impl<T> Message<T> {
    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    pub fn partition(&self) -> i32 {
        self.record.partition
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub record: Record,
    pub error: DecodeError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage<T> {
    Decoded(Message<T>),
    Failed(DecodeFailure),
}

impl<T> DecodedMessage<T> {
    pub fn record(&self) -> &Record {
        match self {
            DecodedMessage::Decoded(message) => &message.record,
            DecodedMessage::Failed(failure) => &failure.record,
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, DecodedMessage::Decoded(_))
    }
}

pub trait Decoder: Send + Sync {
    type Output: Send + Sync + 'static;

    /// Tag checked against the trusted type list and the record's type header.
    fn payload_type(&self) -> &str;

    fn decode_payload(&self, raw: &[u8]) -> Result<Self::Output, DecodeError>;

    fn decode(&self, record: &Record) -> DecodedMessage<Self::Output> {
        let result = check_type_header(record, self.payload_type())
            .and_then(|_| self.decode_payload(&record.value));

        match result {
            Ok(value) => DecodedMessage::Decoded(Message {
                value,
                record: record.clone(),
            }),
            Err(error) => DecodedMessage::Failed(DecodeFailure {
                record: record.clone(),
                error,
            }),
        }
    }
}

fn check_type_header(record: &Record, expected: &str) -> Result<(), DecodeError> {
    match record.header(TYPE_ID_HEADER) {
        None => Ok(()),
        Some(found) if found == expected.as_bytes() => Ok(()),
        Some(found) => Err(DecodeError::UntrustedType {
            found: String::from_utf8_lossy(found).into_owned(),
            expected: expected.to_string(),
        }),
    }
}

/// JSON payloads decoded into `T`. Unknown fields are ignored.
pub struct JsonCodec<T> {
    type_id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> JsonCodec<T> {
    pub fn encode(&self, value: &T) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(value).map_err(|e| DecodeError::Json {
            reason: e.to_string(),
        })
    }
}

impl<T> Decoder for JsonCodec<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Output = T;

    fn payload_type(&self) -> &str {
        &self.type_id
    }

    fn decode_payload(&self, raw: &[u8]) -> Result<T, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        serde_json::from_slice(raw).map_err(|e| DecodeError::Json {
            reason: e.to_string(),
        })
    }
}

/// UTF-8 text payloads.
pub struct StringCodec {
    type_id: String,
}

impl StringCodec {
    pub const TYPE_ID: &'static str = "string";

    pub fn new() -> Self {
        Self {
            type_id: Self::TYPE_ID.to_string(),
        }
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StringCodec {
    type Output = String;

    fn payload_type(&self) -> &str {
        &self.type_id
    }

    fn decode_payload(&self, raw: &[u8]) -> Result<String, DecodeError> {
        String::from_utf8(raw.to_vec()).map_err(|e| DecodeError::Utf8 {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        age: Option<u32>,
    }

    fn person_codec() -> JsonCodec<Person> {
        JsonCodec::new("person")
    }

    #[test]
    fn test_json_round_trip() {
        let codec = person_codec();
        let people = vec![
            Person {
                name: "Ana".to_string(),
                age: Some(30),
            },
            Person {
                name: "".to_string(),
                age: None,
            },
            Person {
                name: "Zoë \"quoted\"".to_string(),
                age: Some(u32::MAX),
            },
        ];

        for person in people {
            let raw = codec.encode(&person).unwrap();
            assert_eq!(codec.decode_payload(&raw).unwrap(), person);
        }
    }

    #[test]
    fn test_decode_keeps_originating_record() {
        let record = Record::new("topic-1", 0, 5, r#"{"name":"Ana","age":30}"#);

        match person_codec().decode(&record) {
            DecodedMessage::Decoded(message) => {
                assert_eq!(
                    message.value,
                    Person {
                        name: "Ana".to_string(),
                        age: Some(30)
                    }
                );
                assert_eq!(message.record, record);
                assert_eq!(message.offset(), 5);
            }
            DecodedMessage::Failed(failure) => panic!("unexpected failure: {}", failure.error),
        }
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let raw = br#"{"name":"Ana","age":30,"email":"ana@example.com","tags":["a"]}"#;
        let person = person_codec().decode_payload(raw).unwrap();
        assert_eq!(person.name, "Ana");
    }

    #[test]
    fn test_malformed_payload_becomes_failure() {
        let record = Record::new("topic-1", 0, 7, vec![0xde, 0xad, 0xbe, 0xef]);
        let decoded = person_codec().decode(&record);

        assert!(!decoded.is_decoded());
        assert_eq!(decoded.record(), &record);
        match decoded {
            DecodedMessage::Failed(DecodeFailure {
                error: DecodeError::Json { .. },
                ..
            }) => {}
            other => panic!("expected JSON failure, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let decoded = person_codec().decode(&Record::new("topic-1", 0, 1, Vec::new()));
        match decoded {
            DecodedMessage::Failed(failure) => assert_eq!(failure.error, DecodeError::Empty),
            other => panic!("expected empty failure, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_type_header_is_rejected() {
        let record = Record::new("topic-1", 0, 9, r#"{"name":"Ana","age":30}"#)
            .with_header(TYPE_ID_HEADER, "com.example.Admin");

        match person_codec().decode(&record) {
            DecodedMessage::Failed(failure) => assert_eq!(
                failure.error,
                DecodeError::UntrustedType {
                    found: "com.example.Admin".to_string(),
                    expected: "person".to_string(),
                }
            ),
            other => panic!("expected untrusted type, got {other:?}"),
        }
    }

    #[test]
    fn test_matching_type_header_is_accepted() {
        let record = Record::new("topic-1", 0, 9, r#"{"name":"Ana"}"#)
            .with_header(TYPE_ID_HEADER, "person");
        assert!(person_codec().decode(&record).is_decoded());
    }

    #[test]
    fn test_decode_is_idempotent() {
        let codec = person_codec();
        let record = Record::new("topic-1", 3, 11, r#"{"name":"Bo","age":4}"#);
        assert_eq!(codec.decode(&record), codec.decode(&record));
    }

    #[test]
    fn test_string_codec() {
        let codec = StringCodec::new();
        assert_eq!(codec.payload_type(), "string");
        assert_eq!(codec.decode_payload(b"hello kafka").unwrap(), "hello kafka");
        assert!(matches!(
            codec.decode_payload(&[0xff, 0xfe]),
            Err(DecodeError::Utf8 { .. })
        ));
        assert_eq!(codec.decode_payload(b"").unwrap(), "");
    }
}
