use serde::{Deserialize, Serialize};

/// Lifetime player record, read and written through the persistence adapter.
///
/// `auto_cash_out` is opaque client preference data (clients encode
/// `totalBets = -1` as "infinite"); the server stores and echoes it without
/// ever consulting it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub balance: u64,
    pub total_flights: u64,
    pub flights_won: u64,
    pub total_wagered: u64,
    pub total_won: f64,
    pub best_multiplier: f64,
    #[serde(default)]
    pub auto_cash_out: serde_json::Value,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl User {
    pub fn new(user_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0,
            total_flights: 0,
            flights_won: 0,
            total_wagered: 0,
            total_won: 0.0,
            best_multiplier: 0.0,
            auto_cash_out: serde_json::Value::Null,
            is_deleted: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Balance never goes negative: debits saturate at zero.
    pub fn debit_saturating(&mut self, amount: u64) {
        self.balance = self.balance.saturating_sub(amount);
    }

    pub fn credit(&mut self, amount: u64) {
        self.balance = self.balance.saturating_add(amount);
    }

    /// Fold one resolved flight into the lifetime stats. Keeps
    /// `flights_won <= total_flights` by construction.
    pub fn record_flight(&mut self, won: bool, bet_amount: u64, win_amount: f64, multiplier: f64) {
        self.total_flights += 1;
        if won {
            self.flights_won += 1;
            self.total_won += win_amount;
            if multiplier > self.best_multiplier {
                self.best_multiplier = multiplier;
            }
        }
        self.total_wagered = self.total_wagered.saturating_add(bet_amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_saturates_at_zero() {
        let mut user = User::new("player_1", 0);
        user.credit(100);
        user.debit_saturating(250);
        assert_eq!(user.balance, 0);
    }

    #[test]
    fn flights_won_never_exceeds_total() {
        let mut user = User::new("player_1", 0);
        for i in 0..20 {
            user.record_flight(i % 3 == 0, 10, 25.0, 2.5);
        }
        assert!(user.flights_won <= user.total_flights);
        assert_eq!(user.total_flights, 20);
    }

    #[test]
    fn best_multiplier_tracks_wins_only() {
        let mut user = User::new("player_1", 0);
        user.record_flight(false, 10, 0.0, 99.0);
        assert_eq!(user.best_multiplier, 0.0);
        user.record_flight(true, 10, 31.0, 3.1);
        assert_eq!(user.best_multiplier, 3.1);
    }
}
