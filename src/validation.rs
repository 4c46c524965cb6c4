//! Identifier and input validation for storage keys, content paths and state paths.

/// Identifier validation errors with helpful messages
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier cannot be empty")]
    Empty,

    #[error("identifier is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("identifier cannot start or end with whitespace")]
    InvalidWhitespace,

    #[error("identifier contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },

    #[error("identifier contains path separators or traversal sequences")]
    PathTraversal,
}

/// State path validation errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path has an empty segment")]
    EmptySegment,

    #[error("path is nested deeper than {max} segments")]
    TooDeep { max: usize },

    #[error("path segment contains control characters")]
    ControlCharacters,
}

pub const MAX_EXPERIENCE_ID_LEN: usize = 64;
pub const MAX_PLAYER_ID_LEN: usize = 128;
pub const MAX_PATH_DEPTH: usize = 16;
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Validate an experience id: it names a directory under the content root, so only
/// ASCII letters, digits, `_` and `-` are accepted.
pub fn validate_identifier(id: &str) -> Result<(), IdentifierError> {
    if id.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if id.len() > MAX_EXPERIENCE_ID_LEN {
        return Err(IdentifierError::TooLong {
            max: MAX_EXPERIENCE_ID_LEN,
        });
    }
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(IdentifierError::PathTraversal);
    }
    let invalid: String = id
        .chars()
        .filter(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        .collect();
    if !invalid.is_empty() {
        return Err(IdentifierError::InvalidCharacters { chars: invalid });
    }
    Ok(())
}

/// Validate a player id handed to us by the upstream layer. Player ids are opaque
/// (emails, UUIDs, handles) so the rules only reject what would break keys or logs.
pub fn validate_player_id(id: &str) -> Result<(), IdentifierError> {
    if id.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if id.chars().count() > MAX_PLAYER_ID_LEN {
        return Err(IdentifierError::TooLong {
            max: MAX_PLAYER_ID_LEN,
        });
    }
    if id.trim() != id {
        return Err(IdentifierError::InvalidWhitespace);
    }
    if id.chars().any(|c| c.is_control()) {
        let chars = id
            .chars()
            .filter(|c| c.is_control())
            .map(|c| format!("\\u{{{:04x}}}", c as u32))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(IdentifierError::InvalidCharacters { chars });
    }
    Ok(())
}

/// Encode an id for use inside a `:`-delimited sled key.
pub fn storage_key_segment(id: &str) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    utf8_percent_encode(id, NON_ALPHANUMERIC).to_string()
}

/// Check a dot-addressed state path for structural sanity. Whether it resolves is
/// decided later against the actual document.
pub fn validate_state_path(path: &str) -> Result<(), PathError> {
    if path.trim().is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.len() > MAX_PATH_DEPTH {
        return Err(PathError::TooDeep {
            max: MAX_PATH_DEPTH,
        });
    }
    for segment in segments {
        if segment.trim().is_empty() {
            return Err(PathError::EmptySegment);
        }
        if segment.chars().any(|c| c.is_control()) {
            return Err(PathError::ControlCharacters);
        }
    }
    Ok(())
}

/// Strip control characters and cap length. Player messages go into prompts and logs.
pub fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .take(MAX_MESSAGE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("wylding-woods").is_ok());
        assert!(validate_identifier("west_of_house2").is_ok());

        assert_eq!(validate_identifier(""), Err(IdentifierError::Empty));
        assert_eq!(validate_identifier("../etc"), Err(IdentifierError::PathTraversal));
        assert_eq!(validate_identifier("a/b"), Err(IdentifierError::PathTraversal));
        assert!(matches!(
            validate_identifier("has space"),
            Err(IdentifierError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            validate_identifier(&"x".repeat(65)),
            Err(IdentifierError::TooLong { max: 64 })
        ));
    }

    #[test]
    fn test_player_id_validation() {
        assert!(validate_player_id("alice@example.com").is_ok());
        assert!(validate_player_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_player_id("José María").is_ok());

        assert_eq!(validate_player_id(" alice"), Err(IdentifierError::InvalidWhitespace));
        assert!(validate_player_id("ali\x00ce").is_err());
        assert!(validate_player_id("").is_err());
    }

    #[test]
    fn test_storage_key_segment() {
        assert_eq!(storage_key_segment("alice"), "alice");
        assert_eq!(storage_key_segment("a:b"), "a%3Ab");
        assert!(!storage_key_segment("x:y:z").contains(':'));
    }

    #[test]
    fn test_state_path_validation() {
        assert!(validate_state_path("player.inventory").is_ok());
        assert!(validate_state_path("locations.west_of_house.items").is_ok());
        assert_eq!(validate_state_path(""), Err(PathError::Empty));
        assert_eq!(validate_state_path("player..inventory"), Err(PathError::EmptySegment));
        assert_eq!(validate_state_path("player."), Err(PathError::EmptySegment));
        let deep = vec!["a"; 17].join(".");
        assert_eq!(validate_state_path(&deep), Err(PathError::TooDeep { max: 16 }));
    }

    #[test]
    fn test_message_sanitization() {
        assert_eq!(sanitize_message("  take lamp  "), "take lamp");
        assert_eq!(sanitize_message("take\x00\x07 lamp"), "take lamp");
        assert_eq!(sanitize_message(&"a".repeat(5000)).len(), MAX_MESSAGE_CHARS);
    }
}
