use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use consume_core::errors::HandlerError;
use consume_core::{Handler, HandlerRegistry, JsonCodec, Message, StringCodec};

pub const PERSON_TYPE_ID: &str = "person";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Person {
    pub name: String,
    pub age: Option<i32>,
}

/// Logs every text message with where it was read from.
pub struct StringLogger;

#[async_trait]
impl Handler<String> for StringLogger {
    async fn handle(&self, message: &Message<String>) -> Result<(), HandlerError> {
        info!(
            thread = ?std::thread::current().id(),
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            "Message: {}",
            message.value
        );
        Ok(())
    }
}

pub struct PersonLogger;

#[async_trait]
impl Handler<Person> for PersonLogger {
    async fn handle(&self, message: &Message<Person>) -> Result<(), HandlerError> {
        let person = &message.value;
        if person.name.trim().is_empty() {
            return Err(HandlerError::failed("person has no name"));
        }
        info!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            name = %person.name,
            age = ?person.age,
            "Received person"
        );
        Ok(())
    }
}

/// Handlers available to listeners, by the name used in configuration.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("string-logger", StringCodec::new(), StringLogger)
        .register(
            "person-logger",
            JsonCodec::<Person>::new(PERSON_TYPE_ID),
            PersonLogger,
        );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use consume_core::codec::Decoder;
    use consume_core::{DecodedMessage, Record};

    fn decode_person(payload: &str) -> DecodedMessage<Person> {
        JsonCodec::<Person>::new(PERSON_TYPE_ID).decode(&Record::new("topic-1", 0, 5, payload))
    }

    #[test]
    fn test_person_decodes_with_unknown_fields() {
        match decode_person(r#"{"name":"Ana","age":30,"email":"ana@example.com"}"#) {
            DecodedMessage::Decoded(message) => {
                assert_eq!(
                    message.value,
                    Person {
                        name: "Ana".to_string(),
                        age: Some(30)
                    }
                );
                assert_eq!(message.offset(), 5);
            }
            DecodedMessage::Failed(failure) => panic!("unexpected failure: {}", failure.error),
        }
    }

    #[test]
    fn test_person_age_is_optional() {
        let DecodedMessage::Decoded(message) = decode_person(r#"{"name":"Bia"}"#) else {
            panic!("expected a decoded person");
        };
        assert_eq!(message.value.age, None);
    }

    #[test]
    fn test_person_accepts_negative_age() {
        let DecodedMessage::Decoded(message) = decode_person(r#"{"name":"Caio","age":-1}"#) else {
            panic!("expected a decoded person");
        };
        assert_eq!(message.value.age, Some(-1));
    }

    #[test]
    fn test_person_serializes_like_producer_payload() {
        let json = serde_json::to_value(Person {
            name: "Ana".to_string(),
            age: Some(30),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"name": "Ana", "age": 30}));
    }

    #[tokio::test]
    async fn test_person_logger_rejects_blank_name() {
        let message = Message {
            value: Person {
                name: " ".to_string(),
                age: None,
            },
            record: Record::new("topic-1", 0, 1, r#"{"name":" "}"#),
        };
        assert!(PersonLogger.handle(&message).await.is_err());
    }

    #[test]
    fn test_registry_exposes_both_handlers() {
        let registry = registry();
        let trusted = vec!["string".to_string(), PERSON_TYPE_ID.to_string()];

        assert_eq!(
            registry.resolve("person-logger", &trusted).unwrap().payload_type(),
            PERSON_TYPE_ID
        );
        assert_eq!(
            registry.resolve("string-logger", &trusted).unwrap().payload_type(),
            "string"
        );
    }
}
