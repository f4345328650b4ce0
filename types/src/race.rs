use serde::{Deserialize, Serialize};

/// Races span many rounds: four hours on the wall clock.
pub const RACE_DURATION_MS: u64 = 4 * 60 * 60 * 1000;

/// Leaderboard projections keep at most this many participants per race.
pub const MAX_RACE_PARTICIPANTS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl RaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Pending => "pending",
            RaceStatus::Active => "active",
            RaceStatus::Completed => "completed",
            RaceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RaceStatus::Pending),
            "active" => Some(RaceStatus::Active),
            "completed" => Some(RaceStatus::Completed),
            "cancelled" => Some(RaceStatus::Cancelled),
            _ => None,
        }
    }
}

/// The race record owned by the lifecycle manager. At most one race is
/// `active` at any time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    /// Timestamp-encoded (`race_YYYYMMDDHHMMSS`), lexicographically monotone
    /// while the clock is monotone.
    pub race_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub actual_end_time: Option<u64>,
    pub status: RaceStatus,
    pub final_prize_pool: f64,
    pub final_contribution: f64,
    pub total_participants: u64,
    pub finalized_at: Option<u64>,
}

impl Race {
    pub fn new(race_id: String, start_time: u64) -> Self {
        Self::with_duration(race_id, start_time, RACE_DURATION_MS)
    }

    pub fn with_duration(race_id: String, start_time: u64, duration_ms: u64) -> Self {
        Self {
            race_id,
            start_time,
            end_time: start_time + duration_ms,
            actual_end_time: None,
            status: RaceStatus::Active,
            final_prize_pool: 0.0,
            final_contribution: 0.0,
            total_participants: 0,
            finalized_at: None,
        }
    }
}

/// Per-race per-user Top-1000 projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceParticipant {
    pub race_id: String,
    pub user_id: String,
    pub total_bet_amount: u64,
    pub total_win_amount: f64,
    /// Only positive per-session profit accrues; never negative.
    pub net_profit: f64,
    pub contribution_to_pool: f64,
    pub session_count: u64,
    pub rank: u32,
    pub last_update_time: u64,
}

impl RaceParticipant {
    pub fn new(race_id: String, user_id: String, now_ms: u64) -> Self {
        Self {
            race_id,
            user_id,
            total_bet_amount: 0,
            total_win_amount: 0.0,
            net_profit: 0.0,
            contribution_to_pool: 0.0,
            session_count: 0,
            rank: 0,
            last_update_time: now_ms,
        }
    }
}

/// Leaderboard order: contribution descending, user id ascending on ties.
/// Used for both the Top-1000 cap and prize ranking.
pub fn contribution_order(a: &RaceParticipant, b: &RaceParticipant) -> std::cmp::Ordering {
    b.contribution_to_pool
        .total_cmp(&a.contribution_to_pool)
        .then_with(|| a.user_id.cmp(&b.user_id))
}

/// Secondary order for ad-hoc user lookups: net profit descending, user id
/// ascending on ties.
pub fn net_profit_order(a: &RaceParticipant, b: &RaceParticipant) -> std::cmp::Ordering {
    b.net_profit
        .total_cmp(&a.net_profit)
        .then_with(|| a.user_id.cmp(&b.user_id))
}
