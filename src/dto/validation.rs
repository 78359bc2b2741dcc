//! Validation helpers for DTOs.

use validator::ValidationError;

/// Longest display name accepted at login.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Validates that a display name, when given, is printable and reasonably short.
///
/// An empty name is accepted; the hub falls back to the identity's display name.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let length = name.chars().count();
    if length > MAX_DISPLAY_NAME_LEN {
        let mut err = ValidationError::new("display_name_length");
        err.message = Some(
            format!("Display name must be at most {MAX_DISPLAY_NAME_LEN} characters (got {length})")
                .into(),
        );
        return Err(err);
    }

    if name.chars().any(char::is_control) {
        let mut err = ValidationError::new("display_name_format");
        err.message = Some("Display name must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

/// Normalize a requested group name, returning `None` when it is blank.
pub fn normalize_group_name(group: &str) -> Option<&str> {
    let trimmed = group.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
