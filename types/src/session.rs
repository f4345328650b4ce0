use serde::{Deserialize, Serialize};

use crate::{validate_bet_amount, validate_user_id, ValidationError};

/// One resolved flight as reported by the settlement pathway, before the
/// aggregation cache stamps it with a race id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    pub user_id: String,
    pub bet_amount: u64,
    pub crash_multiplier: f64,
    /// Zero means the player rode the curve into the crash and lost.
    pub cash_out_multiplier: f64,
    pub win_amount: f64,
    pub game_start_time: u64,
    pub game_end_time: u64,
    #[serde(default)]
    pub is_free_mode: bool,
}

impl SessionInput {
    /// Range validation for the record pathway. Rejects, never clamps.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_user_id(&self.user_id)?;
        validate_bet_amount(self.bet_amount)?;
        if self.crash_multiplier < 1.0 {
            return Err(ValidationError::new(
                "crashMultiplier",
                format!("must be >= 1.0, got {}", self.crash_multiplier),
            ));
        }
        if self.cash_out_multiplier < 0.0 {
            return Err(ValidationError::new(
                "cashOutMultiplier",
                "must be >= 0",
            ));
        }
        if self.win_amount < 0.0 {
            return Err(ValidationError::new("winAmount", "must be >= 0"));
        }
        if self.is_win() && self.win_amount <= 0.0 {
            return Err(ValidationError::new(
                "winAmount",
                "cash-out above zero requires a positive win amount",
            ));
        }
        if !self.is_win() && self.win_amount > 0.0 {
            return Err(ValidationError::new(
                "winAmount",
                "losing session cannot carry a win amount",
            ));
        }
        if self.game_end_time < self.game_start_time {
            return Err(ValidationError::new(
                "gameEndTime",
                "must not precede gameStartTime",
            ));
        }
        Ok(())
    }

    pub fn is_win(&self) -> bool {
        self.cash_out_multiplier > 0.0
    }

    pub fn profit(&self) -> f64 {
        self.win_amount - self.bet_amount as f64
    }
}

/// Fully-stamped session as held in the cache and flushed to storage.
///
/// Invariant: `is_win <=> cash_out_multiplier > 0 <=> profit > 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub session_id: String,
    pub race_id: String,
    pub user_id: String,
    pub bet_amount: u64,
    pub crash_multiplier: f64,
    pub cash_out_multiplier: f64,
    pub is_win: bool,
    pub win_amount: f64,
    pub profit: f64,
    pub game_start_time: u64,
    pub game_end_time: u64,
    pub game_duration: u64,
    pub is_free_mode: bool,
    /// Ingest timestamp assigned by the cache.
    pub timestamp: u64,
}

impl GameSession {
    pub fn from_input(input: SessionInput, session_id: String, race_id: String, now_ms: u64) -> Self {
        let profit = input.profit();
        Self {
            session_id,
            race_id,
            user_id: input.user_id,
            bet_amount: input.bet_amount,
            crash_multiplier: input.crash_multiplier,
            cash_out_multiplier: input.cash_out_multiplier,
            is_win: input.cash_out_multiplier > 0.0,
            win_amount: input.win_amount,
            profit,
            game_start_time: input.game_start_time,
            game_end_time: input.game_end_time,
            game_duration: input.game_end_time.saturating_sub(input.game_start_time),
            is_free_mode: input.is_free_mode,
            timestamp: now_ms,
        }
    }

    /// Positive-profit clamp used for the pool contribution rule.
    pub fn net_profit(&self) -> f64 {
        self.profit.max(0.0)
    }
}
