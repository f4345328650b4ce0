pub mod overrides;
pub mod prize;
pub mod race;
pub mod session;
pub mod user;

pub use overrides::NextRoundOverride;
pub use prize::{PrizeAward, PrizeStatus, RacePrize, MIN_PRIZE_POOL};
pub use race::{Race, RaceParticipant, RaceStatus, RACE_DURATION_MS};
pub use session::{GameSession, SessionInput};
pub use user::User;

use serde::Serialize;
use thiserror::Error;

pub const MIN_USER_ID_LEN: usize = 8;
pub const MAX_USER_ID_LEN: usize = 50;

pub const MIN_BET_AMOUNT: u64 = 1;
pub const MAX_BET_AMOUNT: u64 = 999_999_999;

/// Input rejected by a validation path. Ingest paths clamp instead; the two
/// must never be mixed.
#[derive(Clone, Debug, Error, Serialize)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.len() < MIN_USER_ID_LEN || user_id.len() > MAX_USER_ID_LEN {
        return Err(ValidationError::new(
            "userId",
            format!(
                "must be {MIN_USER_ID_LEN}-{MAX_USER_ID_LEN} characters, got {}",
                user_id.len()
            ),
        ));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::new(
            "userId",
            "only [A-Za-z0-9_-] characters are allowed",
        ));
    }
    Ok(())
}

pub fn validate_bet_amount(bet_amount: u64) -> Result<(), ValidationError> {
    if !(MIN_BET_AMOUNT..=MAX_BET_AMOUNT).contains(&bet_amount) {
        return Err(ValidationError::new(
            "betAmount",
            format!("must be in [{MIN_BET_AMOUNT}, {MAX_BET_AMOUNT}], got {bet_amount}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_bounds() {
        assert!(validate_user_id("player_1").is_ok());
        assert!(validate_user_id("abc-DEF-123_xyz").is_ok());
        assert!(validate_user_id("short").is_err());
        assert!(validate_user_id(&"x".repeat(51)).is_err());
        assert!(validate_user_id("has space!").is_err());
        assert!(validate_user_id("emoji🚀name").is_err());
    }

    #[test]
    fn bet_amount_bounds() {
        assert!(validate_bet_amount(0).is_err());
        assert!(validate_bet_amount(1).is_ok());
        assert!(validate_bet_amount(999_999_999).is_ok());
        assert!(validate_bet_amount(1_000_000_000).is_err());
    }
}
