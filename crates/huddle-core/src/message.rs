//! Message identity and input validation.

use huddle_protocol::{MessageId, SYSTEM_AUTHOR};
use uuid::Uuid;

/// Default maximum message length, in characters.
pub const MAX_TEXT_LENGTH: usize = 2000;

/// Default maximum display name length, in characters.
pub const MAX_IDENTITY_LENGTH: usize = 64;

/// Generate a unique message ID.
///
/// UUIDv7 puts a millisecond timestamp in the high bits and random data in
/// the rest, so IDs sort roughly by creation time and do not collide when
/// several are generated in the same millisecond.
#[must_use]
pub fn generate_message_id() -> MessageId {
    MessageId::new(Uuid::now_v7().to_string())
}

/// Validate message text, returning it trimmed.
///
/// # Errors
///
/// Returns an error message if the text is empty after trimming or longer
/// than `max_len` characters.
pub fn validate_text(text: &str, max_len: usize) -> Result<&str, &'static str> {
    let text = text.trim();
    if text.is_empty() {
        return Err("Message text cannot be empty");
    }
    if text.chars().count() > max_len {
        return Err("Message text too long");
    }
    Ok(text)
}

/// Validate a display name, returning it trimmed.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long, contains control
/// characters, or is the reserved system author.
pub fn validate_identity(identity: &str, max_len: usize) -> Result<&str, &'static str> {
    let identity = identity.trim();
    if identity.is_empty() {
        return Err("Display name cannot be empty");
    }
    if identity.chars().count() > max_len {
        return Err("Display name too long");
    }
    if identity.chars().any(char::is_control) {
        return Err("Display name contains invalid characters");
    }
    if identity.eq_ignore_ascii_case(SYSTEM_AUTHOR) {
        return Err("Display name is reserved");
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_unique_message_ids() {
        let ids: HashSet<MessageId> = (0..10_000).map(|_| generate_message_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_unique_ids_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| (0..1000).map(|_| generate_message_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
    }

    #[test]
    fn test_text_validation() {
        assert_eq!(validate_text("  hi  ", MAX_TEXT_LENGTH), Ok("hi"));
        assert!(validate_text("", MAX_TEXT_LENGTH).is_err());
        assert!(validate_text(" \n\t ", MAX_TEXT_LENGTH).is_err());
        assert!(validate_text(&"a".repeat(11), 10).is_err());
        assert!(validate_text(&"é".repeat(10), 10).is_ok());
    }

    #[test]
    fn test_identity_validation() {
        assert_eq!(validate_identity(" Alice ", MAX_IDENTITY_LENGTH), Ok("Alice"));
        assert!(validate_identity("", MAX_IDENTITY_LENGTH).is_err());
        assert!(validate_identity("Al\u{7}ice", MAX_IDENTITY_LENGTH).is_err());
        assert!(validate_identity("System", MAX_IDENTITY_LENGTH).is_err());
        assert!(validate_identity("system", MAX_IDENTITY_LENGTH).is_err());
        assert!(validate_identity(&"a".repeat(65), MAX_IDENTITY_LENGTH).is_err());
    }
}
