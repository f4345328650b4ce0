use std::collections::HashMap;
use std::sync::Mutex;

use updraft_types::overrides::{clamp_bet_amount, clamp_multiplier};
use updraft_types::NextRoundOverride;

/// In-memory store of pending per-user crash overrides. All mutations run
/// under one lock, which serializes the read-compare-delete in
/// `consume_if_match` per user.
#[derive(Default)]
pub struct OverrideStore {
    inner: Mutex<HashMap<String, NextRoundOverride>>,
}

impl OverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, NextRoundOverride>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Override store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Upsert: absent fields keep their current values; a fresh record
    /// defaults to `(10, 0)`. Values clamp into range rather than erroring.
    pub fn set(
        &self,
        user_id: &str,
        bet_amount: Option<u64>,
        multiplier: Option<f64>,
        now_ms: u64,
    ) -> NextRoundOverride {
        let mut inner = self.lock();
        let record = inner
            .entry(user_id.to_string())
            .or_insert_with(|| NextRoundOverride::new(user_id, now_ms));
        if let Some(bet_amount) = bet_amount {
            record.next_bet_amount = clamp_bet_amount(bet_amount);
        }
        if let Some(multiplier) = multiplier {
            record.next_crash_multiplier = clamp_multiplier(multiplier);
        }
        record.updated_at = now_ms;
        record.clone()
    }

    pub fn get(&self, user_id: &str) -> Option<NextRoundOverride> {
        self.lock().get(user_id).cloned()
    }

    /// Atomic consume: returns the multiplier and deletes the record only
    /// when it is armed and the bet amount matches exactly; otherwise the
    /// record is left untouched.
    pub fn consume_if_match(&self, user_id: &str, bet_amount: u64) -> Option<f64> {
        let mut inner = self.lock();
        let matches = inner
            .get(user_id)
            .map(|record| record.is_armed() && record.next_bet_amount == bet_amount)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        inner
            .remove(user_id)
            .map(|record| record.next_crash_multiplier)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
