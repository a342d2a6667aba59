//! Topic and payload validation.
//!
//! Every message passes through [`validate`] before it is written to the
//! outbox, so malformed input is rejected with a typed error inside the
//! caller's transaction instead of surfacing later in a consumer.

use snafu::Snafu;

/// Maximum length of a topic name, in bytes.
pub const MAX_TOPIC_LEN: usize = 64;

/// Maximum size of a message body, in bytes (256 KiB).
pub const MAX_BODY_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ValidationError {
    #[snafu(display("Topic must not be empty"))]
    EmptyTopic,

    #[snafu(display("Topic is {len} bytes long, the limit is {}", MAX_TOPIC_LEN))]
    TopicTooLong { len: usize },

    #[snafu(display("Topic contains invalid character {ch:?}"))]
    InvalidTopicCharacter { ch: char },

    #[snafu(display("Body is {size} bytes, the limit is {}", MAX_BODY_SIZE))]
    BodyTooLarge { size: usize },
}

fn is_topic_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')
}

/// Checks a topic name: 1 to 64 bytes of `[A-Za-z0-9._-]`.
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(ValidationError::TopicTooLong { len: topic.len() });
    }

    match topic.chars().find(|ch| !is_topic_char(*ch)) {
        Some(ch) => Err(ValidationError::InvalidTopicCharacter { ch }),
        None => Ok(()),
    }
}

/// Checks everything the outbox writer requires of a message before insertion.
pub fn validate(topic: &str, body: &[u8]) -> Result<(), ValidationError> {
    validate_topic(topic)?;

    if body.len() > MAX_BODY_SIZE {
        return Err(ValidationError::BodyTooLarge { size: body.len() });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topics() {
        assert_eq!(validate_topic("user_actions"), Ok(()));
        assert_eq!(validate_topic("orders.v2-eu"), Ok(()));
        assert_eq!(validate_topic(&"a".repeat(MAX_TOPIC_LEN)), Ok(()));
    }

    #[test]
    fn test_empty_topic() {
        assert_eq!(validate_topic(""), Err(ValidationError::EmptyTopic));
    }

    #[test]
    fn test_topic_too_long() {
        let topic = "a".repeat(MAX_TOPIC_LEN + 1);
        assert_eq!(
            validate_topic(&topic),
            Err(ValidationError::TopicTooLong {
                len: MAX_TOPIC_LEN + 1
            })
        );
    }

    #[test]
    fn test_invalid_characters() {
        assert_eq!(
            validate_topic("user actions"),
            Err(ValidationError::InvalidTopicCharacter { ch: ' ' })
        );
        assert_eq!(
            validate_topic("orders/eu"),
            Err(ValidationError::InvalidTopicCharacter { ch: '/' })
        );
        assert_eq!(
            validate_topic("café"),
            Err(ValidationError::InvalidTopicCharacter { ch: 'é' })
        );
    }

    #[test]
    fn test_body_limit() {
        assert_eq!(validate("t", &vec![0u8; MAX_BODY_SIZE]), Ok(()));
        assert_eq!(
            validate("t", &vec![0u8; MAX_BODY_SIZE + 1]),
            Err(ValidationError::BodyTooLarge {
                size: MAX_BODY_SIZE + 1
            })
        );
    }

    #[test]
    fn test_topic_checked_before_body() {
        assert_eq!(
            validate("", &vec![0u8; MAX_BODY_SIZE + 1]),
            Err(ValidationError::EmptyTopic)
        );
    }
}
