use serde::{Deserialize, Serialize};

/// Guaranteed minimum pool regardless of contributions.
pub const MIN_PRIZE_POOL: f64 = 50_000.0;

/// Ranks 1-3 take fixed shares; ranks 4-10 split the remaining 14% equally.
const RANK_ONE_SHARE: f64 = 0.50;
const RANK_TWO_SHARE: f64 = 0.25;
const RANK_THREE_SHARE: f64 = 0.11;
const TAIL_SHARE: f64 = 0.14;
const TAIL_RANKS: u32 = 7;

pub const MAX_PRIZE_RANK: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrizeStatus {
    Pending,
    Claimed,
}

impl PrizeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrizeStatus::Pending => "pending",
            PrizeStatus::Claimed => "claimed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PrizeStatus::Pending),
            "claimed" => Some(PrizeStatus::Claimed),
            _ => None,
        }
    }
}

/// Claimable prize record. `pending -> claimed` is irreversible; records
/// never expire. `credited` guards the balance credit so a prize pays out at
/// most once per `(prize_id, user_id)` across grant and claim pathways.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RacePrize {
    pub prize_id: String,
    pub race_id: String,
    pub user_id: String,
    pub rank: u32,
    pub prize_amount: u64,
    pub percentage: f64,
    pub status: PrizeStatus,
    #[serde(default)]
    pub credited: bool,
    pub created_at: u64,
    pub claimed_at: Option<u64>,
    /// Performance snapshot at settlement time.
    pub contribution: f64,
    pub net_profit: f64,
    pub session_count: u64,
}

/// One computed award within a distribution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeAward {
    pub rank: u32,
    pub percentage: f64,
    pub amount: u64,
}

pub fn rank_share(rank: u32) -> Option<f64> {
    match rank {
        1 => Some(RANK_ONE_SHARE),
        2 => Some(RANK_TWO_SHARE),
        3 => Some(RANK_THREE_SHARE),
        4..=MAX_PRIZE_RANK => Some(TAIL_SHARE / TAIL_RANKS as f64),
        _ => None,
    }
}

/// Compute the per-rank awards for a settled race. Amounts are floored to
/// whole coins; ranks beyond the participant count produce no entry; an
/// empty leaderboard (or a pool with no contributions) produces nothing.
pub fn prize_distribution(
    total_pool: f64,
    should_distribute: bool,
    participant_count: usize,
) -> Vec<PrizeAward> {
    if !should_distribute || participant_count == 0 {
        return Vec::new();
    }
    let last_rank = (participant_count as u32).min(MAX_PRIZE_RANK);
    (1..=last_rank)
        .filter_map(|rank| {
            let percentage = rank_share(rank)?;
            Some(PrizeAward {
                rank,
                percentage,
                amount: (total_pool * percentage).floor() as u64,
            })
        })
        .collect()
}

/// `max(contributed, 50_000)` with distribution gated on any real
/// contribution existing.
pub fn effective_pool(contributed: f64) -> (f64, bool) {
    (contributed.max(MIN_PRIZE_POOL), contributed > 0.0)
}
