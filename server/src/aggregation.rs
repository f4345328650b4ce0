use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::interval;
use uuid::Uuid;

use updraft_types::race::{contribution_order, net_profit_order, MAX_RACE_PARTICIPANTS};
use updraft_types::{prize, GameSession, Race, RaceParticipant, SessionInput};

use crate::metrics::CoreMetrics;
use crate::now_ms;
use crate::store::{with_backoff, Store};

/// 1% of gross win funds the race pool.
const CONTRIBUTION_RATE: f64 = 0.01;

const BATCH_SAVE_INTERVAL: Duration = Duration::from_secs(30);
const PARTICIPANT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const PENDING_EXPIRY_MS: u64 = 60 * 60 * 1000;
const FINALIZED_RETENTION_MS: u64 = 10 * 60 * 1000;
const GLOBAL_STATS_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
const RESTORE_SESSION_LIMIT: usize = 1000;
const MAX_SAVE_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizePool {
    pub contributed_amount: f64,
    pub total_pool: f64,
    pub should_distribute_prizes: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardWithUser {
    pub top: Vec<RaceParticipant>,
    pub user: RaceParticipant,
    pub user_rank: u64,
    /// Equal to `user_rank` inside the Top-1000; a stable pseudo-random
    /// value in [1001, 10000] beyond it.
    pub display_rank: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRaceData {
    pub participant: RaceParticipant,
    pub rank: u64,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub window_ms: u64,
    pub total_games: u64,
    pub total_wagered: u64,
    pub total_won: f64,
    pub unique_players: u64,
    pub highest_crash: f64,
    pub biggest_win: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentCrash {
    pub session_id: String,
    pub crash_multiplier: f64,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub current_race_id: Option<String>,
    pub races_cached: usize,
    pub current_participants: usize,
    pub sessions_cached: usize,
    pub pending_saves: usize,
}

#[derive(Clone, Debug)]
pub struct FinalizedRace {
    pub race_id: String,
    pub leaderboard: Vec<RaceParticipant>,
    pub prize_pool: PrizePool,
    pub finalized_at: u64,
}

struct PendingSession {
    session: GameSession,
    attempts: u32,
    enqueued_at: u64,
}

#[derive(Default)]
struct RaceTable {
    global_sessions: Vec<GameSession>,
    user_sessions: HashMap<String, Vec<GameSession>>,
    participants: HashMap<String, RaceParticipant>,
    finalized_at: Option<u64>,
}

impl RaceTable {
    /// Full contribution-ordered leaderboard with ranks assigned.
    fn sorted_participants(&self) -> Vec<RaceParticipant> {
        let mut rows: Vec<RaceParticipant> = self.participants.values().cloned().collect();
        rows.sort_by(contribution_order);
        for (idx, row) in rows.iter_mut().enumerate() {
            row.rank = idx as u32 + 1;
        }
        rows
    }

    fn contributed(&self) -> f64 {
        self.participants
            .values()
            .map(|p| p.contribution_to_pool)
            .sum()
    }
}

#[derive(Default)]
struct CacheInner {
    current_race: Option<String>,
    races: HashMap<String, RaceTable>,
    pending_saves: VecDeque<PendingSession>,
}

/// In-memory, race-scoped session aggregation: authoritative between
/// flushes. One lock guards all tables, which serializes per-user ingest and
/// gives leaderboard readers a consistent snapshot.
pub struct RaceCache {
    inner: Mutex<CacheInner>,
    store: Arc<Store>,
    metrics: Arc<CoreMetrics>,
}

impl RaceCache {
    pub fn new(store: Arc<Store>, metrics: Arc<CoreMetrics>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            store,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Race cache lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn current_race_id(&self) -> Option<String> {
        self.lock().current_race.clone()
    }

    pub fn set_current_race(&self, race: &Race) {
        let mut inner = self.lock();
        inner.current_race = Some(race.race_id.clone());
        inner.races.entry(race.race_id.clone()).or_default();
        tracing::info!(race_id = %race.race_id, "Current race set");
    }

    /// Ingest one finished session into the active race. Returns `None` when
    /// no race is running (the caller logs); stats clamp rather than error.
    pub fn add_session(&self, input: SessionInput) -> Option<GameSession> {
        let now = now_ms();
        let mut inner = self.lock();
        let Some(race_id) = inner.current_race.clone() else {
            self.metrics.inc_session_rejected_no_race();
            return None;
        };

        let session = GameSession::from_input(
            input,
            Uuid::new_v4().to_string(),
            race_id.clone(),
            now,
        );

        let table = inner.races.entry(race_id.clone()).or_default();
        table.global_sessions.push(session.clone());
        table
            .user_sessions
            .entry(session.user_id.clone())
            .or_default()
            .push(session.clone());

        let participant = table
            .participants
            .entry(session.user_id.clone())
            .or_insert_with(|| {
                RaceParticipant::new(race_id.clone(), session.user_id.clone(), now)
            });
        participant.total_bet_amount = participant
            .total_bet_amount
            .saturating_add(session.bet_amount);
        participant.total_win_amount += session.win_amount;
        participant.net_profit += session.net_profit();
        participant.contribution_to_pool += session.win_amount.max(0.0) * CONTRIBUTION_RATE;
        participant.session_count += 1;
        participant.last_update_time = now;

        if table.participants.len() > MAX_RACE_PARTICIPANTS {
            Self::enforce_cap(table);
        }

        inner.pending_saves.push_back(PendingSession {
            session: session.clone(),
            attempts: 0,
            enqueued_at: now,
        });

        self.metrics.inc_session_ingested();
        Some(session)
    }

    /// Drop everything beyond rank 1000, in the same ordering the prize
    /// ranking uses.
    fn enforce_cap(table: &mut RaceTable) {
        let mut rows: Vec<(String, f64)> = table
            .participants
            .values()
            .map(|p| (p.user_id.clone(), p.contribution_to_pool))
            .collect();
        rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (user_id, _) in rows.drain(MAX_RACE_PARTICIPANTS..) {
            table.participants.remove(&user_id);
        }
    }

    pub fn get_race_leaderboard(&self, race_id: &str, limit: usize) -> Option<Vec<RaceParticipant>> {
        let inner = self.lock();
        let table = inner.races.get(race_id)?;
        let mut rows = table.sorted_participants();
        rows.truncate(limit);
        Some(rows)
    }

    pub fn get_race_leaderboard_with_user(
        &self,
        race_id: &str,
        user_id: &str,
        top_limit: usize,
    ) -> Option<LeaderboardWithUser> {
        let inner = self.lock();
        let table = inner.races.get(race_id)?;
        let sorted = table.sorted_participants();

        let (user, rank) = match sorted.iter().position(|p| p.user_id == user_id) {
            Some(idx) => (sorted[idx].clone(), idx as u64 + 1),
            None => {
                // Zero-stat users rank after every participant that would
                // order before an all-zero row with this id.
                let virtual_row =
                    RaceParticipant::new(race_id.to_string(), user_id.to_string(), 0);
                let before = sorted
                    .iter()
                    .filter(|p| contribution_order(p, &virtual_row) == std::cmp::Ordering::Less)
                    .count();
                (virtual_row, before as u64 + 1)
            }
        };

        let display_rank = if rank <= MAX_RACE_PARTICIPANTS as u64 {
            rank
        } else {
            pseudo_display_rank(user_id)
        };

        let mut top = sorted;
        top.truncate(top_limit);
        Some(LeaderboardWithUser {
            top,
            user,
            user_rank: rank,
            display_rank,
        })
    }

    /// Ad-hoc single-user lookup ranked by net profit (contribution ties are
    /// common; net profit separates them for display).
    pub fn get_user_race_data(&self, race_id: &str, user_id: &str) -> Option<UserRaceData> {
        let inner = self.lock();
        let table = inner.races.get(race_id)?;
        let participant = table.participants.get(user_id)?.clone();
        let rank = table
            .participants
            .values()
            .filter(|p| net_profit_order(p, &participant) == std::cmp::Ordering::Less)
            .count() as u64
            + 1;
        Some(UserRaceData { participant, rank })
    }

    /// Most recent first; falls back to the current race when none is named.
    pub fn get_user_sessions(
        &self,
        user_id: &str,
        race_id: Option<&str>,
        limit: usize,
    ) -> Vec<GameSession> {
        let inner = self.lock();
        let race_id = match race_id {
            Some(race_id) => race_id.to_string(),
            None => match &inner.current_race {
                Some(race_id) => race_id.clone(),
                None => return Vec::new(),
            },
        };
        inner
            .races
            .get(&race_id)
            .and_then(|table| table.user_sessions.get(user_id))
            .map(|sessions| sessions.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_recent_crashes(&self, limit: usize) -> Vec<RecentCrash> {
        let inner = self.lock();
        let Some(race_id) = &inner.current_race else {
            return Vec::new();
        };
        inner
            .races
            .get(race_id)
            .map(|table| {
                table
                    .global_sessions
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|session| RecentCrash {
                        session_id: session.session_id.clone(),
                        crash_multiplier: session.crash_multiplier,
                        timestamp: session.timestamp,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Rolling 24-hour stats over the union of in-memory session lists.
    pub fn get_global_stats(&self) -> GlobalStats {
        let cutoff = now_ms().saturating_sub(GLOBAL_STATS_WINDOW_MS);
        let inner = self.lock();
        let mut stats = GlobalStats {
            window_ms: GLOBAL_STATS_WINDOW_MS,
            total_games: 0,
            total_wagered: 0,
            total_won: 0.0,
            unique_players: 0,
            highest_crash: 0.0,
            biggest_win: 0.0,
        };
        let mut players = std::collections::HashSet::new();
        for table in inner.races.values() {
            for session in &table.global_sessions {
                if session.timestamp < cutoff {
                    continue;
                }
                stats.total_games += 1;
                stats.total_wagered = stats.total_wagered.saturating_add(session.bet_amount);
                stats.total_won += session.win_amount;
                if session.crash_multiplier > stats.highest_crash {
                    stats.highest_crash = session.crash_multiplier;
                }
                if session.win_amount > stats.biggest_win {
                    stats.biggest_win = session.win_amount;
                }
                players.insert(session.user_id.clone());
            }
        }
        stats.unique_players = players.len() as u64;
        stats
    }

    pub fn prize_pool(&self, race_id: &str) -> Option<PrizePool> {
        let inner = self.lock();
        let table = inner.races.get(race_id)?;
        Some(Self::pool_of(table))
    }

    fn pool_of(table: &RaceTable) -> PrizePool {
        let contributed = table.contributed();
        let (total_pool, should_distribute) = prize::effective_pool(contributed);
        PrizePool {
            contributed_amount: contributed,
            total_pool,
            should_distribute_prizes: should_distribute,
        }
    }

    pub fn cache_status(&self) -> CacheStatus {
        let inner = self.lock();
        let current_participants = inner
            .current_race
            .as_ref()
            .and_then(|race_id| inner.races.get(race_id))
            .map(|table| table.participants.len())
            .unwrap_or(0);
        CacheStatus {
            current_race_id: inner.current_race.clone(),
            races_cached: inner.races.len(),
            current_participants,
            sessions_cached: inner
                .races
                .values()
                .map(|table| table.global_sessions.len())
                .sum(),
            pending_saves: inner.pending_saves.len(),
        }
    }

    /// Force-flush the race's sessions and final projections, then hand back
    /// the settlement snapshot. The in-memory table stays queryable for ten
    /// more minutes.
    pub async fn finalize_race(&self, race_id: &str) -> Option<FinalizedRace> {
        let batch: Vec<PendingSession> = {
            let mut inner = self.lock();
            if !inner.races.contains_key(race_id) {
                return None;
            }
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = inner
                .pending_saves
                .drain(..)
                .partition(|pending| pending.session.race_id == race_id);
            inner.pending_saves = rest;
            matching.into_iter().collect()
        };
        self.save_batch(batch).await;

        let finalized_at = now_ms();
        let (leaderboard, pool) = {
            let mut inner = self.lock();
            let table = inner.races.get_mut(race_id)?;
            table.finalized_at = Some(finalized_at);
            (table.sorted_participants(), Self::pool_of(table))
        };

        let mut projection = leaderboard.clone();
        projection.truncate(MAX_RACE_PARTICIPANTS);
        if !projection.is_empty() {
            if let Err(err) =
                with_backoff(|| self.store.bulk_upsert_participants(projection.clone())).await
            {
                tracing::error!(race_id, "Final participant flush failed: {err}");
            }
        }

        Some(FinalizedRace {
            race_id: race_id.to_string(),
            leaderboard,
            prize_pool: pool,
            finalized_at,
        })
    }

    /// Rebuild the in-memory tables for a still-running race after a
    /// restart.
    pub async fn restore_from_database(&self, race: &Race) -> Result<(), crate::store::StoreError> {
        let participants =
            with_backoff(|| self.store.find_participants(&race.race_id)).await?;
        let sessions = with_backoff(|| {
            self.store
                .find_recent_sessions(&race.race_id, RESTORE_SESSION_LIMIT)
        })
        .await?;

        let mut inner = self.lock();
        inner.current_race = Some(race.race_id.clone());
        let table = inner.races.entry(race.race_id.clone()).or_default();
        table.finalized_at = None;
        table.participants = participants
            .into_iter()
            .map(|row| (row.user_id.clone(), row))
            .collect();
        // Rows arrive reverse-chronological; reinsert in play order.
        for session in sessions.into_iter().rev() {
            table
                .user_sessions
                .entry(session.user_id.clone())
                .or_default()
                .push(session.clone());
            table.global_sessions.push(session);
        }
        tracing::info!(
            race_id = %race.race_id,
            participants = table.participants.len(),
            sessions = table.global_sessions.len(),
            "Race cache restored"
        );
        Ok(())
    }

    /// Batch-save cycle: drain the queue, bulk insert, re-enqueue failures
    /// up to three attempts each.
    pub async fn flush_pending(&self) {
        let batch: Vec<PendingSession> = {
            let mut inner = self.lock();
            inner.pending_saves.drain(..).collect()
        };
        self.save_batch(batch).await;
    }

    async fn save_batch(&self, batch: Vec<PendingSession>) {
        if batch.is_empty() {
            return;
        }
        let sessions: Vec<GameSession> = batch.iter().map(|p| p.session.clone()).collect();
        match self.store.insert_sessions_bulk(sessions).await {
            Ok(outcome) => {
                if !outcome.failed.is_empty() {
                    let failed_ids: std::collections::HashSet<String> = outcome
                        .failed
                        .iter()
                        .map(|session| session.session_id.clone())
                        .collect();
                    let failed = batch
                        .into_iter()
                        .filter(|pending| failed_ids.contains(&pending.session.session_id))
                        .collect();
                    self.requeue(failed);
                }
            }
            Err(err) => {
                self.metrics.inc_flush_failure();
                tracing::warn!("Session batch save failed: {err}");
                self.requeue(batch);
            }
        }
    }

    fn requeue(&self, failed: Vec<PendingSession>) {
        let mut dropped = 0u64;
        let mut inner = self.lock();
        for mut pending in failed {
            pending.attempts += 1;
            if pending.attempts >= MAX_SAVE_ATTEMPTS {
                dropped += 1;
                tracing::error!(
                    session_id = %pending.session.session_id,
                    attempts = pending.attempts,
                    "Dropping session after repeated save failures"
                );
            } else {
                inner.pending_saves.push_back(pending);
            }
        }
        drop(inner);
        if dropped > 0 {
            self.metrics.add_sessions_dropped(dropped);
        }
    }

    /// Participant-sync cycle: snapshot the current race's Top-1000 and
    /// upsert it. Backoff lives in the store retry helper; a cycle that
    /// still fails is skipped until the next interval.
    pub async fn sync_participants(&self) {
        let rows = {
            let inner = self.lock();
            let Some(race_id) = &inner.current_race else {
                return;
            };
            let Some(table) = inner.races.get(race_id) else {
                return;
            };
            let mut rows = table.sorted_participants();
            rows.truncate(MAX_RACE_PARTICIPANTS);
            rows
        };
        if rows.is_empty() {
            return;
        }
        if let Err(err) = with_backoff(|| self.store.bulk_upsert_participants(rows.clone())).await
        {
            self.metrics.inc_participant_sync_failure();
            tracing::error!("ALERT: participant sync failed after retries, skipping cycle: {err}");
        }
    }

    /// Cleanup cycle: expire stale queued saves and evict finalized races
    /// past their retention window.
    pub fn cleanup(&self) {
        let now = now_ms();
        let mut dropped = 0u64;
        let mut inner = self.lock();
        inner.pending_saves.retain(|pending| {
            let keep = now.saturating_sub(pending.enqueued_at) < PENDING_EXPIRY_MS;
            if !keep {
                dropped += 1;
            }
            keep
        });
        inner.races.retain(|race_id, table| {
            match table.finalized_at {
                Some(finalized_at) if now.saturating_sub(finalized_at) >= FINALIZED_RETENTION_MS => {
                    tracing::info!(race_id = %race_id, "Evicting finalized race from cache");
                    false
                }
                _ => true,
            }
        });
        drop(inner);
        if dropped > 0 {
            self.metrics.add_sessions_dropped(dropped);
            tracing::warn!(dropped, "Expired pending sessions discarded");
        }
    }

    pub fn start_background_tasks(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(BATCH_SAVE_INTERVAL);
            loop {
                ticker.tick().await;
                cache.flush_pending().await;
            }
        });

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(PARTICIPANT_SYNC_INTERVAL);
            loop {
                ticker.tick().await;
                cache.sync_participants().await;
            }
        });

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                cache.cleanup();
            }
        });
    }
}

/// Stable pseudo-random display rank in [1001, 10000] for users outside the
/// Top-1000.
fn pseudo_display_rank(user_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    1001 + hasher.finish() % 9000
}

#[cfg(test)]
mod tests {
    use super::*;
    use updraft_types::RaceStatus;

    fn temp_cache() -> (tempfile::TempDir, Arc<Store>, RaceCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("updraft.db")).expect("open store"));
        let cache = RaceCache::new(Arc::clone(&store), Arc::new(CoreMetrics::default()));
        (dir, store, cache)
    }

    fn race(race_id: &str) -> Race {
        Race::new(race_id.to_string(), now_ms())
    }

    fn input(user_id: &str, bet: u64, win: f64) -> SessionInput {
        SessionInput {
            user_id: user_id.to_string(),
            bet_amount: bet,
            crash_multiplier: 5.0,
            cash_out_multiplier: if win > 0.0 { 2.0 } else { 0.0 },
            win_amount: win,
            game_start_time: 0,
            game_end_time: 1_000,
            is_free_mode: false,
        }
    }

    #[tokio::test]
    async fn ingest_requires_an_active_race() {
        let (_dir, _store, cache) = temp_cache();
        assert!(cache.add_session(input("player_1", 100, 0.0)).is_none());

        cache.set_current_race(&race("race_1"));
        let session = cache.add_session(input("player_1", 100, 0.0)).unwrap();
        assert_eq!(session.race_id, "race_1");
    }

    #[tokio::test]
    async fn participant_stats_accumulate_and_clamp() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        cache.add_session(input("player_1", 100, 300.0)).unwrap();
        cache.add_session(input("player_1", 100, 0.0)).unwrap();
        cache.add_session(input("player_1", 50, 60.0)).unwrap();

        let board = cache.get_race_leaderboard("race_1", 10).unwrap();
        assert_eq!(board.len(), 1);
        let row = &board[0];
        assert_eq!(row.total_bet_amount, 250);
        assert_eq!(row.total_win_amount, 360.0);
        // Losses never subtract: 200 + 0 + 10.
        assert_eq!(row.net_profit, 210.0);
        assert!((row.contribution_to_pool - 3.6).abs() < 1e-9);
        assert_eq!(row.session_count, 3);
        assert!(row.net_profit >= 0.0);
        assert!(row.contribution_to_pool >= 0.0);
        assert!(row.session_count >= 1);
    }

    #[tokio::test]
    async fn leaderboard_orders_by_contribution_then_user_id() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        cache.add_session(input("charlie_1", 10, 500.0)).unwrap();
        cache.add_session(input("alice_001", 10, 300.0)).unwrap();
        cache.add_session(input("bobby_001", 10, 300.0)).unwrap();

        let board = cache.get_race_leaderboard("race_1", 10).unwrap();
        let ids: Vec<&str> = board.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, ["charlie_1", "alice_001", "bobby_001"]);
        let ranks: Vec<u32> = board.iter().map(|p| p.rank).collect();
        assert_eq!(ranks, [1, 2, 3]);
    }

    #[tokio::test]
    async fn top_1000_cap_keeps_highest_contributors() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        for i in 0..1_050u64 {
            let user = format!("player_{i:04}");
            // Distinct contributions, increasing with i.
            cache
                .add_session(input(&user, 10, (i + 1) as f64 * 100.0))
                .unwrap();
        }

        let board = cache.get_race_leaderboard("race_1", 2_000).unwrap();
        assert_eq!(board.len(), MAX_RACE_PARTICIPANTS);
        // The 50 lowest contributors fell off.
        assert!(board.iter().all(|p| p.contribution_to_pool >= 51.0 - 1e-9));
        assert_eq!(board[0].user_id, "player_1049");
    }

    #[tokio::test]
    async fn leaderboard_with_user_handles_unranked_users() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        cache.add_session(input("winner_01", 10, 400.0)).unwrap();

        let view = cache
            .get_race_leaderboard_with_user("race_1", "stranger_1", 10)
            .unwrap();
        assert_eq!(view.user.session_count, 0);
        assert_eq!(view.user.contribution_to_pool, 0.0);
        // Placed after the single positive participant.
        assert_eq!(view.user_rank, 2);
        assert_eq!(view.display_rank, 2);
        assert_eq!(view.top.len(), 1);
    }

    #[tokio::test]
    async fn display_rank_is_stable_beyond_the_cap() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        for i in 0..MAX_RACE_PARTICIPANTS as u64 {
            cache
                .add_session(input(&format!("player_{i:04}"), 10, (i + 1) as f64 * 100.0))
                .unwrap();
        }

        let view = cache
            .get_race_leaderboard_with_user("race_1", "stranger_1", 5)
            .unwrap();
        assert_eq!(view.user_rank, MAX_RACE_PARTICIPANTS as u64 + 1);
        assert!((1001..=10_000).contains(&view.display_rank));

        let again = cache
            .get_race_leaderboard_with_user("race_1", "stranger_1", 5)
            .unwrap();
        assert_eq!(view.display_rank, again.display_rank);
    }

    #[tokio::test]
    async fn user_race_data_ranks_by_net_profit() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        // Equal contributions; net profit differs through bet size.
        cache.add_session(input("high_roll", 10, 500.0)).unwrap();
        cache.add_session(input("low_rolls", 400, 500.0)).unwrap();

        let high = cache.get_user_race_data("race_1", "high_roll").unwrap();
        let low = cache.get_user_race_data("race_1", "low_rolls").unwrap();
        assert_eq!(high.rank, 1);
        assert_eq!(low.rank, 2);
        assert!(cache.get_user_race_data("race_1", "missing_1").is_none());
    }

    #[tokio::test]
    async fn user_sessions_are_most_recent_first() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        let first = cache.add_session(input("player_1", 10, 0.0)).unwrap();
        let second = cache.add_session(input("player_1", 20, 0.0)).unwrap();
        let third = cache.add_session(input("player_1", 30, 0.0)).unwrap();

        let sessions = cache.get_user_sessions("player_1", None, 2);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, third.session_id);
        assert_eq!(sessions[1].session_id, second.session_id);
        let _ = first;

        let crashes = cache.get_recent_crashes(10);
        assert_eq!(crashes.len(), 3);
        assert_eq!(crashes[0].session_id, third.session_id);
    }

    #[tokio::test]
    async fn global_stats_cover_the_window() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        cache.add_session(input("player_1", 100, 500.0)).unwrap();
        cache.add_session(input("player_2", 50, 0.0)).unwrap();

        let stats = cache.get_global_stats();
        assert_eq!(stats.total_games, 2);
        assert_eq!(stats.total_wagered, 150);
        assert_eq!(stats.total_won, 500.0);
        assert_eq!(stats.unique_players, 2);
        assert_eq!(stats.biggest_win, 500.0);
        assert_eq!(stats.highest_crash, 5.0);
    }

    #[tokio::test]
    async fn pool_applies_minimum_guarantee() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));

        // Contributions from the documented example: 2180 total.
        let contributions: [(&str, f64); 11] = [
            ("user_aaaa", 1_000.0),
            ("user_bbbb", 500.0),
            ("user_cccc", 220.0),
            ("user_dddd", 120.0),
            ("user_eeee", 100.0),
            ("user_ffff", 80.0),
            ("user_gggg", 60.0),
            ("user_hhhh", 40.0),
            ("user_iiii", 30.0),
            ("user_jjjj", 20.0),
            ("user_kkkk", 10.0),
        ];
        for (user, contribution) in contributions {
            cache
                .add_session(input(user, 1, contribution * 100.0))
                .unwrap();
        }

        let pool = cache.prize_pool("race_1").unwrap();
        assert!((pool.contributed_amount - 2_180.0).abs() < 1e-6);
        assert_eq!(pool.total_pool, 50_000.0);
        assert!(pool.should_distribute_prizes);

        let awards =
            prize::prize_distribution(pool.total_pool, pool.should_distribute_prizes, 11);
        assert_eq!(awards[0].amount, 25_000);
        assert_eq!(awards[1].amount, 12_500);
        assert_eq!(awards[2].amount, 5_500);
        assert!(awards[3..].iter().all(|award| award.amount == 1_000));
        assert_eq!(awards.len(), 10, "rank 11 draws no prize");
    }

    #[tokio::test]
    async fn finalize_flushes_and_retains_for_trailing_queries() {
        let (_dir, store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        cache.add_session(input("player_1", 10, 200.0)).unwrap();
        cache.add_session(input("player_2", 10, 100.0)).unwrap();

        let finalized = cache.finalize_race("race_1").await.unwrap();
        assert_eq!(finalized.leaderboard.len(), 2);
        assert_eq!(finalized.leaderboard[0].user_id, "player_1");
        assert!(finalized.prize_pool.should_distribute_prizes);

        // Sessions were force-flushed.
        let persisted = store.find_recent_sessions("race_1", 10).await.unwrap();
        assert_eq!(persisted.len(), 2);
        let rows = store.find_participants("race_1").await.unwrap();
        assert_eq!(rows.len(), 2);

        // Still queryable during the retention window.
        assert!(cache.get_race_leaderboard("race_1", 10).is_some());
        assert_eq!(cache.cache_status().pending_saves, 0);
    }

    #[tokio::test]
    async fn restore_rebuilds_leaderboard_in_contribution_order() {
        let (_dir, store, cache) = temp_cache();

        let mut persisted = race("race_1");
        persisted.status = RaceStatus::Active;
        let mut rows = Vec::new();
        for i in 0..23u64 {
            let mut row = RaceParticipant::new(
                "race_1".to_string(),
                format!("player_{i:02}"),
                now_ms(),
            );
            row.contribution_to_pool = (i + 1) as f64 * 7.0;
            row.net_profit = (i + 1) as f64 * 700.0;
            row.session_count = 1;
            rows.push(row);
        }
        store.bulk_upsert_participants(rows.clone()).await.unwrap();

        cache.restore_from_database(&persisted).await.unwrap();
        assert_eq!(cache.current_race_id().as_deref(), Some("race_1"));

        let board = cache.get_race_leaderboard("race_1", 100).unwrap();
        assert_eq!(board.len(), 23);
        assert_eq!(board[0].user_id, "player_22");
        assert_eq!(board[0].rank, 1);
        let mut expected = rows;
        expected.sort_by(contribution_order);
        let expected_ids: Vec<String> = expected.into_iter().map(|r| r.user_id).collect();
        let actual_ids: Vec<String> = board.into_iter().map(|r| r.user_id).collect();
        assert_eq!(actual_ids, expected_ids);
    }

    #[tokio::test]
    async fn cleanup_expires_stale_pending_entries() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        cache.add_session(input("player_1", 10, 0.0)).unwrap();

        {
            let mut inner = cache.lock();
            for pending in inner.pending_saves.iter_mut() {
                pending.enqueued_at = pending.enqueued_at.saturating_sub(PENDING_EXPIRY_MS + 1);
            }
        }
        cache.cleanup();
        assert_eq!(cache.cache_status().pending_saves, 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_races_past_retention() {
        let (_dir, _store, cache) = temp_cache();
        cache.set_current_race(&race("race_1"));
        cache.add_session(input("player_1", 10, 0.0)).unwrap();
        cache.finalize_race("race_1").await.unwrap();

        {
            let mut inner = cache.lock();
            let table = inner.races.get_mut("race_1").unwrap();
            table.finalized_at =
                Some(now_ms().saturating_sub(FINALIZED_RETENTION_MS + 1));
        }
        cache.cleanup();
        assert!(cache.get_race_leaderboard("race_1", 10).is_none());
    }
}
