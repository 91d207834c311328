//! Validation helpers for command inputs.

use validator::{ValidationError, ValidationErrors};

use crate::error::RoomError;

/// Longest accepted player name, in characters.
const MAX_NAME_LENGTH: usize = 32;

/// Validates that a room code is exactly 4 ASCII digits.
pub fn validate_room_code(code: &str) -> Result<(), ValidationError> {
    if code.len() != 4 || !code.chars().all(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("room_code");
        err.message = Some("room code must be exactly 4 digits".into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a player name is non-blank and of reasonable length.
pub fn validate_player_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("player_name");
        err.message = Some("player name must not be empty".into());
        return Err(err);
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        let mut err = ValidationError::new("player_name_length");
        err.message =
            Some(format!("player name must be at most {MAX_NAME_LENGTH} characters").into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a submitted answer carries any text.
pub fn validate_answer(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        let mut err = ValidationError::new("answer");
        err.message = Some("answer must not be empty".into());
        return Err(err);
    }
    Ok(())
}

/// Wrap a single field check into the domain error type.
pub fn checked(field: &'static str, result: Result<(), ValidationError>) -> Result<(), RoomError> {
    result.map_err(|err| {
        let mut errors = ValidationErrors::new();
        errors.add(field, err);
        errors.into()
    })
}
