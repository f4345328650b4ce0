use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use updraft_types::{prize, PrizeStatus, Race, RacePrize, RACE_DURATION_MS};

use crate::aggregation::{PrizePool, RaceCache};
use crate::metrics::CoreMetrics;
use crate::now_ms;
use crate::store::{with_backoff, CreditOutcome, RaceUpdate, Store, StoreError};

#[derive(Clone, Copy, Debug)]
pub struct RaceManagerConfig {
    pub race_duration_ms: u64,
    pub auto_start_delay: Duration,
}

impl Default for RaceManagerConfig {
    fn default() -> Self {
        Self {
            race_duration_ms: RACE_DURATION_MS,
            auto_start_delay: Duration::from_secs(5),
        }
    }
}

/// Owns race identity and the start/settle cycle. All transitions run under
/// one async lock, so a new race's cache publication can never precede the
/// previous race's finalize flush.
pub struct RaceManager {
    config: RaceManagerConfig,
    store: Arc<Store>,
    cache: Arc<RaceCache>,
    metrics: Arc<CoreMetrics>,
    lifecycle: Mutex<()>,
    current: StdMutex<Option<Race>>,
    last_race_id: StdMutex<Option<String>>,
}

impl RaceManager {
    pub fn new(
        config: RaceManagerConfig,
        store: Arc<Store>,
        cache: Arc<RaceCache>,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            metrics,
            lifecycle: Mutex::new(()),
            current: StdMutex::new(None),
            last_race_id: StdMutex::new(None),
        }
    }

    pub fn current_race(&self) -> Option<Race> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current(&self, race: Option<Race>) {
        match self.current.lock() {
            Ok(mut guard) => *guard = race,
            Err(poisoned) => *poisoned.into_inner() = race,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            sleep(manager.config.auto_start_delay).await;
            if let Err(err) = manager.boot().await {
                error!("Race lifecycle boot failed: {err}");
            }
        });

        // Watchdog only; the scheduled end at `end_time` is authoritative.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(manager.config.race_duration_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.watchdog().await;
            }
        });
    }

    pub(crate) async fn boot(self: &Arc<Self>) -> Result<(), StoreError> {
        match with_backoff(|| self.store.find_active_race()).await? {
            Some(race) if race.end_time > now_ms() => {
                info!(race_id = %race.race_id, end_time = race.end_time, "Restoring in-flight race");
                self.cache.restore_from_database(&race).await?;
                self.remember_race_id(&race.race_id);
                self.set_current(Some(race.clone()));
                self.schedule_end(&race);
                Ok(())
            }
            Some(race) => {
                info!(race_id = %race.race_id, "Active race already expired; settling now");
                let _guard = self.lifecycle.lock().await;
                self.end_race_core(&race).await;
                self.start_core().await?;
                Ok(())
            }
            None => {
                let _guard = self.lifecycle.lock().await;
                self.start_core().await?;
                Ok(())
            }
        }
    }

    /// End any current race, then open a fresh one.
    pub async fn start_new_race(self: &Arc<Self>) -> Result<Race, StoreError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(race) = self.current_race() {
            self.set_current(None);
            self.end_race_core(&race).await;
        }
        self.start_core().await
    }

    /// Settle the named race and immediately start the next one. Stale
    /// timers (from races already settled) fall through without effect.
    pub async fn end_race_by_id(self: &Arc<Self>, race_id: &str) {
        let _guard = self.lifecycle.lock().await;
        let Some(race) = self.current_race() else {
            return;
        };
        if race.race_id != race_id {
            return;
        }
        self.set_current(None);
        self.end_race_core(&race).await;
        if let Err(err) = self.start_core().await {
            error!("Failed to start next race: {err}");
        }
    }

    async fn watchdog(self: &Arc<Self>) {
        let Some(race) = self.current_race() else {
            return;
        };
        if race.end_time <= now_ms() {
            warn!(race_id = %race.race_id, "Watchdog ending overdue race");
            self.end_race_by_id(&race.race_id).await;
        }
    }

    async fn start_core(self: &Arc<Self>) -> Result<Race, StoreError> {
        let now = now_ms();
        let race_id = self.generate_race_id(now);
        let race = Race::with_duration(race_id, now, self.config.race_duration_ms);

        with_backoff(|| self.store.insert_race(race.clone())).await?;
        self.cache.set_current_race(&race);
        self.set_current(Some(race.clone()));
        self.schedule_end(&race);
        self.metrics.inc_race_started();
        info!(race_id = %race.race_id, end_time = race.end_time, "Race started");
        Ok(race)
    }

    fn schedule_end(self: &Arc<Self>, race: &Race) {
        let manager = Arc::clone(self);
        let race_id = race.race_id.clone();
        let delay = Duration::from_millis(race.end_time.saturating_sub(now_ms()));
        tokio::spawn(async move {
            sleep(delay).await;
            manager.end_race_by_id(&race_id).await;
        });
    }

    async fn end_race_core(&self, race: &Race) {
        let now = now_ms();
        let finalized = self.cache.finalize_race(&race.race_id).await;
        let (leaderboard, pool, finalized_at) = match finalized {
            Some(finalized) => (
                finalized.leaderboard,
                finalized.prize_pool,
                finalized.finalized_at,
            ),
            None => {
                warn!(race_id = %race.race_id, "Race missing from cache at settlement");
                (
                    Vec::new(),
                    PrizePool {
                        contributed_amount: 0.0,
                        total_pool: prize::MIN_PRIZE_POOL,
                        should_distribute_prizes: false,
                    },
                    now,
                )
            }
        };

        let awards = prize::prize_distribution(
            pool.total_pool,
            pool.should_distribute_prizes,
            leaderboard.len(),
        );
        let prizes: Vec<RacePrize> = awards
            .iter()
            .map(|award| {
                let row = &leaderboard[award.rank as usize - 1];
                RacePrize {
                    prize_id: Uuid::new_v4().to_string(),
                    race_id: race.race_id.clone(),
                    user_id: row.user_id.clone(),
                    rank: award.rank,
                    prize_amount: award.amount,
                    percentage: award.percentage,
                    status: PrizeStatus::Pending,
                    credited: false,
                    created_at: now,
                    claimed_at: None,
                    contribution: row.contribution_to_pool,
                    net_profit: row.net_profit,
                    session_count: row.session_count,
                }
            })
            .collect();

        if !prizes.is_empty() {
            self.write_prizes(&prizes).await;
            self.metrics.add_prizes_granted(prizes.len() as u64);
            for prize in &prizes {
                match with_backoff(|| {
                    self.store
                        .credit_prize(&prize.prize_id, &prize.user_id, now)
                })
                .await
                {
                    Ok(CreditOutcome::Credited) | Ok(CreditOutcome::AlreadyCredited) => {}
                    Ok(CreditOutcome::UserMissing) => {
                        warn!(user_id = %prize.user_id, prize_id = %prize.prize_id,
                              "Prize credit skipped: user not found");
                    }
                    Err(err) => {
                        warn!(prize_id = %prize.prize_id, "Prize credit failed: {err}");
                    }
                }
            }
        }

        let patch = RaceUpdate {
            status: Some(updraft_types::RaceStatus::Completed),
            actual_end_time: Some(now),
            final_prize_pool: Some(pool.total_pool),
            final_contribution: Some(pool.contributed_amount),
            total_participants: Some(leaderboard.len() as u64),
            finalized_at: Some(finalized_at),
        };
        if let Err(err) = with_backoff(|| self.store.update_race(&race.race_id, patch.clone())).await
        {
            error!(race_id = %race.race_id, "Race record update failed: {err}");
        }

        self.metrics.inc_race_ended();
        info!(
            race_id = %race.race_id,
            participants = leaderboard.len(),
            prize_pool = pool.total_pool,
            prizes = prizes.len(),
            "Race settled"
        );
    }

    async fn write_prizes(&self, prizes: &[RacePrize]) {
        match self.store.insert_prizes(prizes.to_vec()).await {
            Ok(outcome) => {
                for prize in outcome.failed {
                    if let Err(err) =
                        with_backoff(|| self.store.insert_prize(prize.clone())).await
                    {
                        error!(prize_id = %prize.prize_id, "Prize insert failed: {err}");
                    }
                }
            }
            Err(err) => {
                // Bulk path failed outright; fall back to row-by-row.
                warn!("Bulk prize insert failed, retrying one by one: {err}");
                for prize in prizes {
                    if let Err(err) =
                        with_backoff(|| self.store.insert_prize(prize.clone())).await
                    {
                        error!(prize_id = %prize.prize_id, "Prize insert failed: {err}");
                    }
                }
            }
        }
    }

    /// Timestamp-encoded ids stay strictly increasing even when two races
    /// start within the same clock second.
    fn generate_race_id(&self, now: u64) -> String {
        let mut candidate_ms = now;
        loop {
            let id = race_id_for(candidate_ms);
            let mut last = match self.last_race_id.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last.as_deref().map_or(true, |prev| id.as_str() > prev) {
                *last = Some(id.clone());
                return id;
            }
            drop(last);
            candidate_ms += 1_000;
        }
    }

    fn remember_race_id(&self, race_id: &str) {
        let mut last = match self.last_race_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.as_deref().map_or(true, |prev| race_id > prev) {
            *last = Some(race_id.to_string());
        }
    }
}

fn race_id_for(ms: u64) -> String {
    let datetime = DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default();
    format!("race_{}", datetime.format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use updraft_types::{RaceStatus, SessionInput};

    fn fast_config() -> RaceManagerConfig {
        RaceManagerConfig {
            race_duration_ms: 100_000,
            auto_start_delay: Duration::from_millis(10),
        }
    }

    fn manager_with(
        dir: &tempfile::TempDir,
        config: RaceManagerConfig,
    ) -> (Arc<Store>, Arc<RaceCache>, Arc<RaceManager>) {
        let store = Arc::new(Store::open(&dir.path().join("updraft.db")).expect("open store"));
        let metrics = Arc::new(CoreMetrics::default());
        let cache = Arc::new(RaceCache::new(Arc::clone(&store), Arc::clone(&metrics)));
        let manager = Arc::new(RaceManager::new(
            config,
            Arc::clone(&store),
            Arc::clone(&cache),
            metrics,
        ));
        (store, cache, manager)
    }

    fn winning_session(user_id: &str, win: f64) -> SessionInput {
        SessionInput {
            user_id: user_id.to_string(),
            bet_amount: 10,
            crash_multiplier: 5.0,
            cash_out_multiplier: 2.0,
            win_amount: win,
            game_start_time: 0,
            game_end_time: 1_000,
            is_free_mode: false,
        }
    }

    #[tokio::test]
    async fn race_ids_are_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _cache, manager) = manager_with(&dir, fast_config());

        let first = manager.start_new_race().await.unwrap();
        let second = manager.start_new_race().await.unwrap();
        let third = manager.start_new_race().await.unwrap();
        assert!(second.race_id > first.race_id);
        assert!(third.race_id > second.race_id);
        assert!(first.race_id.starts_with("race_"));
    }

    #[tokio::test]
    async fn starting_a_race_publishes_it_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache, manager) = manager_with(&dir, fast_config());

        let race = manager.start_new_race().await.unwrap();
        assert_eq!(cache.current_race_id(), Some(race.race_id.clone()));
        let persisted = store.find_active_race().await.unwrap().unwrap();
        assert_eq!(persisted.race_id, race.race_id);
        assert_eq!(
            persisted.end_time - persisted.start_time,
            fast_config().race_duration_ms
        );
    }

    #[tokio::test]
    async fn settlement_writes_prizes_and_credits_winners() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache, manager) = manager_with(&dir, fast_config());

        let race = manager.start_new_race().await.unwrap();
        for (user, win) in [
            ("winner_one", 100_000.0),
            ("winner_two", 50_000.0),
            ("winner_tri", 20_000.0),
        ] {
            store.find_or_create_user(user, 0).await.unwrap();
            cache.add_session(winning_session(user, win)).unwrap();
        }

        manager.end_race_by_id(&race.race_id).await;

        // Pool: 1700 contributed, clamped to 50_000.
        let prizes = store.find_prizes_by_race(&race.race_id).await.unwrap();
        assert_eq!(prizes.len(), 3);
        assert_eq!(prizes[0].user_id, "winner_one");
        assert_eq!(prizes[0].prize_amount, 25_000);
        assert_eq!(prizes[1].prize_amount, 12_500);
        assert_eq!(prizes[2].prize_amount, 5_500);
        assert!(prizes.iter().all(|p| p.status == PrizeStatus::Pending));
        assert!(prizes.iter().all(|p| p.credited));

        // Balances moved at settlement, exactly once.
        let winner = store.find_user("winner_one").await.unwrap().unwrap();
        assert_eq!(winner.balance, 25_000);

        let history = store.find_race_history(5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RaceStatus::Completed);
        assert_eq!(history[0].total_participants, 3);
        assert_eq!(history[0].final_prize_pool, 50_000.0);
        assert!((history[0].final_contribution - 1_700.0).abs() < 1e-6);

        // The next race opened immediately with a strictly greater id.
        let next = manager.current_race().unwrap();
        assert!(next.race_id > race.race_id);
        assert_eq!(cache.current_race_id(), Some(next.race_id));
    }

    #[tokio::test]
    async fn stale_end_timers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _cache, manager) = manager_with(&dir, fast_config());

        let first = manager.start_new_race().await.unwrap();
        let second = manager.start_new_race().await.unwrap();

        // A timer for the already-ended first race must not touch the
        // second one.
        manager.end_race_by_id(&first.race_id).await;
        let current = manager.current_race().unwrap();
        assert_eq!(current.race_id, second.race_id);
    }

    #[tokio::test]
    async fn boot_restores_a_running_race() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache, manager) = manager_with(&dir, fast_config());

        let race = Race::with_duration(
            "race_20260101120000".to_string(),
            now_ms(),
            3_600_000,
        );
        store.insert_race(race.clone()).await.unwrap();
        let mut rows = Vec::new();
        for i in 0..23u64 {
            let mut row = updraft_types::RaceParticipant::new(
                race.race_id.clone(),
                format!("player_{i:02}"),
                now_ms(),
            );
            row.contribution_to_pool = (i + 1) as f64;
            row.session_count = 1;
            rows.push(row);
        }
        store.bulk_upsert_participants(rows).await.unwrap();

        manager.boot().await.unwrap();

        let current = manager.current_race().unwrap();
        assert_eq!(current.race_id, race.race_id);
        let board = cache.get_race_leaderboard(&race.race_id, 100).unwrap();
        assert_eq!(board.len(), 23);
        assert_eq!(board[0].user_id, "player_22");
    }

    #[tokio::test]
    async fn boot_settles_an_expired_race_and_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _cache, manager) = manager_with(&dir, fast_config());

        let race = Race::with_duration("race_20200101000000".to_string(), 1_000, 1_000);
        store.insert_race(race.clone()).await.unwrap();

        manager.boot().await.unwrap();

        let history = store.find_race_history(5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].race_id, race.race_id);
        assert_eq!(history[0].status, RaceStatus::Completed);

        let current = manager.current_race().unwrap();
        assert!(current.race_id > race.race_id);
        assert_eq!(
            store.find_active_race().await.unwrap().unwrap().race_id,
            current.race_id
        );
    }

    #[tokio::test]
    async fn boot_starts_a_race_when_none_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (store, cache, manager) = manager_with(&dir, fast_config());

        manager.boot().await.unwrap();
        let current = manager.current_race().unwrap();
        assert_eq!(cache.current_race_id(), Some(current.race_id.clone()));
        assert!(store.find_active_race().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_races_settle_without_prizes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _cache, manager) = manager_with(&dir, fast_config());

        let race = manager.start_new_race().await.unwrap();
        manager.end_race_by_id(&race.race_id).await;

        let prizes = store.find_prizes_by_race(&race.race_id).await.unwrap();
        assert!(prizes.is_empty());
        let history = store.find_race_history(5).await.unwrap();
        assert_eq!(history[0].total_participants, 0);
    }
}
