use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use updraft_types::{GameSession, PrizeStatus, Race, RaceParticipant, RacePrize, RaceStatus, User};

const REQUEST_BUFFER: usize = 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff schedule for transient persistence errors.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("prize already claimed")]
    AlreadyClaimed,
    #[error("prize belongs to another user")]
    Forbidden,
    #[error("storage busy: {0}")]
    Busy(String),
    #[error("storage failure: {0}")]
    Backend(String),
    #[error("storage worker unavailable")]
    Unavailable,
    #[error("storage request timed out")]
    Timeout,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Busy(_) | StoreError::Timeout | StoreError::Unavailable
        )
    }
}

fn map_sqlite(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Busy(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn is_duplicate(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

/// Retry `op` on transient errors with the {1, 2, 4}s schedule.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < RETRY_DELAYS.len() => {
                warn!(attempt, "Transient storage error, backing off: {err}");
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Outcome of an unordered bulk insert: duplicates are skipped silently,
/// other failures come back for the caller to retry or drop.
#[derive(Debug)]
pub struct BulkOutcome<T> {
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: Vec<T>,
}

impl<T> Default for BulkOutcome<T> {
    fn default() -> Self {
        Self {
            inserted: 0,
            duplicates: 0,
            failed: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited,
    AlreadyCredited,
    UserMissing,
}

/// Patch applied to a race record at settlement.
#[derive(Clone, Debug, Default)]
pub struct RaceUpdate {
    pub status: Option<RaceStatus>,
    pub actual_end_time: Option<u64>,
    pub final_prize_pool: Option<f64>,
    pub final_contribution: Option<f64>,
    pub total_participants: Option<u64>,
    pub finalized_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct RaceStatsRow {
    pub total_races: u64,
    pub completed_races: u64,
    pub total_prizes: u64,
    pub total_prize_amount: u64,
    pub pending_prizes: u64,
}

type Responder<T> = oneshot::Sender<Result<T, StoreError>>;

enum Request {
    FindOrCreateUser {
        user_id: String,
        now_ms: u64,
        reply: Responder<User>,
    },
    FindUser {
        user_id: String,
        reply: Responder<Option<User>>,
    },
    UpsertUser {
        user: Box<User>,
        reply: Responder<()>,
    },
    SoftDeleteUser {
        user_id: String,
        now_ms: u64,
        reply: Responder<()>,
    },
    TopUsers {
        limit: usize,
        reply: Responder<Vec<User>>,
    },
    InsertSessionsBulk {
        sessions: Vec<GameSession>,
        reply: Responder<BulkOutcome<GameSession>>,
    },
    BulkUpsertParticipants {
        rows: Vec<RaceParticipant>,
        reply: Responder<()>,
    },
    InsertRace {
        race: Box<Race>,
        reply: Responder<()>,
    },
    UpdateRace {
        race_id: String,
        patch: RaceUpdate,
        reply: Responder<()>,
    },
    FindActiveRace {
        reply: Responder<Option<Race>>,
    },
    FindRaceHistory {
        limit: usize,
        reply: Responder<Vec<Race>>,
    },
    FindParticipants {
        race_id: String,
        reply: Responder<Vec<RaceParticipant>>,
    },
    FindRecentSessions {
        race_id: String,
        limit: usize,
        reply: Responder<Vec<GameSession>>,
    },
    InsertPrizes {
        prizes: Vec<RacePrize>,
        reply: Responder<BulkOutcome<RacePrize>>,
    },
    InsertPrize {
        prize: Box<RacePrize>,
        reply: Responder<()>,
    },
    FindUserPendingPrizes {
        user_id: String,
        limit: usize,
        reply: Responder<Vec<RacePrize>>,
    },
    FindUserPrizeHistory {
        user_id: String,
        limit: usize,
        reply: Responder<Vec<RacePrize>>,
    },
    FindPrizesByRace {
        race_id: String,
        reply: Responder<Vec<RacePrize>>,
    },
    ClaimPrize {
        prize_id: String,
        user_id: String,
        now_ms: u64,
        reply: Responder<RacePrize>,
    },
    CreditPrize {
        prize_id: String,
        user_id: String,
        now_ms: u64,
        reply: Responder<CreditOutcome>,
    },
    RaceStats {
        reply: Responder<RaceStatsRow>,
    },
}

/// Typed persistence adapter. A dedicated worker thread owns the sqlite
/// connection; async callers go through an mpsc/oneshot round trip.
pub struct Store {
    sender: mpsc::Sender<Request>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_schema(&conn)?;
        drop(conn);

        let (sender, receiver) = mpsc::channel(REQUEST_BUFFER);
        let path = path.to_path_buf();
        std::thread::spawn(move || worker(path, receiver));

        Ok(Self { sender })
    }

    async fn call<T>(&self, build: impl FnOnce(Responder<T>) -> Request) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| StoreError::Unavailable)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StoreError::Unavailable),
            Err(_) => Err(StoreError::Timeout),
        }
    }

    pub async fn find_or_create_user(&self, user_id: &str, now_ms: u64) -> Result<User, StoreError> {
        let user_id = user_id.to_string();
        self.call(|reply| Request::FindOrCreateUser {
            user_id,
            now_ms,
            reply,
        })
        .await
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let user_id = user_id.to_string();
        self.call(|reply| Request::FindUser { user_id, reply }).await
    }

    pub async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        self.call(|reply| Request::UpsertUser {
            user: Box::new(user),
            reply,
        })
        .await
    }

    pub async fn soft_delete_user(&self, user_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.call(|reply| Request::SoftDeleteUser {
            user_id,
            now_ms,
            reply,
        })
        .await
    }

    pub async fn find_top_users(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        self.call(|reply| Request::TopUsers { limit, reply }).await
    }

    pub async fn insert_sessions_bulk(
        &self,
        sessions: Vec<GameSession>,
    ) -> Result<BulkOutcome<GameSession>, StoreError> {
        self.call(|reply| Request::InsertSessionsBulk { sessions, reply })
            .await
    }

    pub async fn bulk_upsert_participants(
        &self,
        rows: Vec<RaceParticipant>,
    ) -> Result<(), StoreError> {
        self.call(|reply| Request::BulkUpsertParticipants { rows, reply })
            .await
    }

    pub async fn insert_race(&self, race: Race) -> Result<(), StoreError> {
        self.call(|reply| Request::InsertRace {
            race: Box::new(race),
            reply,
        })
        .await
    }

    pub async fn update_race(&self, race_id: &str, patch: RaceUpdate) -> Result<(), StoreError> {
        let race_id = race_id.to_string();
        self.call(|reply| Request::UpdateRace {
            race_id,
            patch,
            reply,
        })
        .await
    }

    pub async fn find_active_race(&self) -> Result<Option<Race>, StoreError> {
        self.call(|reply| Request::FindActiveRace { reply }).await
    }

    pub async fn find_race_history(&self, limit: usize) -> Result<Vec<Race>, StoreError> {
        self.call(|reply| Request::FindRaceHistory { limit, reply })
            .await
    }

    pub async fn find_participants(
        &self,
        race_id: &str,
    ) -> Result<Vec<RaceParticipant>, StoreError> {
        let race_id = race_id.to_string();
        self.call(|reply| Request::FindParticipants { race_id, reply })
            .await
    }

    pub async fn find_recent_sessions(
        &self,
        race_id: &str,
        limit: usize,
    ) -> Result<Vec<GameSession>, StoreError> {
        let race_id = race_id.to_string();
        self.call(|reply| Request::FindRecentSessions {
            race_id,
            limit,
            reply,
        })
        .await
    }

    pub async fn insert_prizes(
        &self,
        prizes: Vec<RacePrize>,
    ) -> Result<BulkOutcome<RacePrize>, StoreError> {
        self.call(|reply| Request::InsertPrizes { prizes, reply })
            .await
    }

    pub async fn insert_prize(&self, prize: RacePrize) -> Result<(), StoreError> {
        self.call(|reply| Request::InsertPrize {
            prize: Box::new(prize),
            reply,
        })
        .await
    }

    pub async fn find_user_pending_prizes(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RacePrize>, StoreError> {
        let user_id = user_id.to_string();
        self.call(|reply| Request::FindUserPendingPrizes {
            user_id,
            limit,
            reply,
        })
        .await
    }

    pub async fn find_user_prize_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<RacePrize>, StoreError> {
        let user_id = user_id.to_string();
        self.call(|reply| Request::FindUserPrizeHistory {
            user_id,
            limit,
            reply,
        })
        .await
    }

    pub async fn find_prizes_by_race(&self, race_id: &str) -> Result<Vec<RacePrize>, StoreError> {
        let race_id = race_id.to_string();
        self.call(|reply| Request::FindPrizesByRace { race_id, reply })
            .await
    }

    /// CAS `pending -> claimed`; credits the user's balance at most once per
    /// `(prize_id, user_id)` inside the same transaction.
    pub async fn claim_prize(
        &self,
        prize_id: &str,
        user_id: &str,
        now_ms: u64,
    ) -> Result<RacePrize, StoreError> {
        let prize_id = prize_id.to_string();
        let user_id = user_id.to_string();
        self.call(|reply| Request::ClaimPrize {
            prize_id,
            user_id,
            now_ms,
            reply,
        })
        .await
    }

    /// Settlement-time grant: credit the winner's balance unless this prize
    /// already credited them.
    pub async fn credit_prize(
        &self,
        prize_id: &str,
        user_id: &str,
        now_ms: u64,
    ) -> Result<CreditOutcome, StoreError> {
        let prize_id = prize_id.to_string();
        let user_id = user_id.to_string();
        self.call(|reply| Request::CreditPrize {
            prize_id,
            user_id,
            now_ms,
            reply,
        })
        .await
    }

    pub async fn race_stats(&self) -> Result<RaceStatsRow, StoreError> {
        self.call(|reply| Request::RaceStats { reply }).await
    }
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         CREATE TABLE IF NOT EXISTS users (
             user_id TEXT PRIMARY KEY,
             balance INTEGER NOT NULL,
             total_flights INTEGER NOT NULL,
             flights_won INTEGER NOT NULL,
             total_wagered INTEGER NOT NULL,
             total_won REAL NOT NULL,
             best_multiplier REAL NOT NULL,
             auto_cash_out TEXT NOT NULL,
             is_deleted INTEGER NOT NULL DEFAULT 0,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS sessions (
             session_id TEXT PRIMARY KEY,
             race_id TEXT NOT NULL,
             user_id TEXT NOT NULL,
             bet_amount INTEGER NOT NULL,
             crash_multiplier REAL NOT NULL,
             cash_out_multiplier REAL NOT NULL,
             is_win INTEGER NOT NULL,
             win_amount REAL NOT NULL,
             profit REAL NOT NULL,
             game_start_time INTEGER NOT NULL,
             game_end_time INTEGER NOT NULL,
             game_duration INTEGER NOT NULL,
             is_free_mode INTEGER NOT NULL,
             timestamp INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS sessions_by_race ON sessions(race_id, timestamp);
         CREATE INDEX IF NOT EXISTS sessions_by_user ON sessions(user_id, timestamp);
         CREATE TABLE IF NOT EXISTS participants (
             race_id TEXT NOT NULL,
             user_id TEXT NOT NULL,
             total_bet_amount INTEGER NOT NULL,
             total_win_amount REAL NOT NULL,
             net_profit REAL NOT NULL,
             contribution_to_pool REAL NOT NULL,
             session_count INTEGER NOT NULL,
             user_rank INTEGER NOT NULL,
             last_update_time INTEGER NOT NULL,
             PRIMARY KEY (race_id, user_id)
         );
         CREATE TABLE IF NOT EXISTS races (
             race_id TEXT PRIMARY KEY,
             start_time INTEGER NOT NULL,
             end_time INTEGER NOT NULL,
             actual_end_time INTEGER,
             status TEXT NOT NULL,
             final_prize_pool REAL NOT NULL,
             final_contribution REAL NOT NULL,
             total_participants INTEGER NOT NULL,
             finalized_at INTEGER
         );
         CREATE INDEX IF NOT EXISTS races_by_status ON races(status, start_time);
         CREATE TABLE IF NOT EXISTS prizes (
             prize_id TEXT PRIMARY KEY,
             race_id TEXT NOT NULL,
             user_id TEXT NOT NULL,
             user_rank INTEGER NOT NULL,
             prize_amount INTEGER NOT NULL,
             percentage REAL NOT NULL,
             status TEXT NOT NULL,
             credited INTEGER NOT NULL DEFAULT 0,
             created_at INTEGER NOT NULL,
             claimed_at INTEGER,
             contribution REAL NOT NULL,
             net_profit REAL NOT NULL,
             session_count INTEGER NOT NULL,
             UNIQUE (race_id, user_id)
         );
         CREATE INDEX IF NOT EXISTS prizes_by_user ON prizes(user_id, status, created_at);",
    )?;
    Ok(())
}

fn worker(path: PathBuf, mut receiver: mpsc::Receiver<Request>) {
    let conn = match Connection::open(&path) {
        Ok(conn) => conn,
        Err(err) => {
            error!("Store worker open failed: {err}");
            return;
        }
    };
    if let Err(err) = conn.busy_timeout(BUSY_TIMEOUT) {
        error!("Store worker busy timeout failed: {err}");
    }

    while let Some(request) = receiver.blocking_recv() {
        match request {
            Request::FindOrCreateUser {
                user_id,
                now_ms,
                reply,
            } => {
                let _ = reply.send(find_or_create_user(&conn, &user_id, now_ms));
            }
            Request::FindUser { user_id, reply } => {
                let _ = reply.send(find_user(&conn, &user_id));
            }
            Request::UpsertUser { user, reply } => {
                let _ = reply.send(upsert_user(&conn, &user));
            }
            Request::SoftDeleteUser {
                user_id,
                now_ms,
                reply,
            } => {
                let _ = reply.send(soft_delete_user(&conn, &user_id, now_ms));
            }
            Request::TopUsers { limit, reply } => {
                let _ = reply.send(top_users(&conn, limit));
            }
            Request::InsertSessionsBulk { sessions, reply } => {
                let _ = reply.send(insert_sessions_bulk(&conn, sessions));
            }
            Request::BulkUpsertParticipants { rows, reply } => {
                let _ = reply.send(bulk_upsert_participants(&conn, rows));
            }
            Request::InsertRace { race, reply } => {
                let _ = reply.send(insert_race(&conn, &race));
            }
            Request::UpdateRace {
                race_id,
                patch,
                reply,
            } => {
                let _ = reply.send(update_race(&conn, &race_id, patch));
            }
            Request::FindActiveRace { reply } => {
                let _ = reply.send(find_active_race(&conn));
            }
            Request::FindRaceHistory { limit, reply } => {
                let _ = reply.send(find_race_history(&conn, limit));
            }
            Request::FindParticipants { race_id, reply } => {
                let _ = reply.send(find_participants(&conn, &race_id));
            }
            Request::FindRecentSessions {
                race_id,
                limit,
                reply,
            } => {
                let _ = reply.send(find_recent_sessions(&conn, &race_id, limit));
            }
            Request::InsertPrizes { prizes, reply } => {
                let _ = reply.send(insert_prizes(&conn, prizes));
            }
            Request::InsertPrize { prize, reply } => {
                let _ = reply.send(insert_prize(&conn, &prize));
            }
            Request::FindUserPendingPrizes {
                user_id,
                limit,
                reply,
            } => {
                let _ = reply.send(find_user_prizes(&conn, &user_id, Some(PrizeStatus::Pending), limit));
            }
            Request::FindUserPrizeHistory {
                user_id,
                limit,
                reply,
            } => {
                let _ = reply.send(find_user_prizes(&conn, &user_id, None, limit));
            }
            Request::FindPrizesByRace { race_id, reply } => {
                let _ = reply.send(find_prizes_by_race(&conn, &race_id));
            }
            Request::ClaimPrize {
                prize_id,
                user_id,
                now_ms,
                reply,
            } => {
                let _ = reply.send(claim_prize(&conn, &prize_id, &user_id, now_ms));
            }
            Request::CreditPrize {
                prize_id,
                user_id,
                now_ms,
                reply,
            } => {
                let _ = reply.send(credit_prize(&conn, &prize_id, &user_id, now_ms));
            }
            Request::RaceStats { reply } => {
                let _ = reply.send(race_stats(&conn));
            }
        }
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let auto_cash_out: String = row.get("auto_cash_out")?;
    Ok(User {
        user_id: row.get("user_id")?,
        balance: row.get("balance")?,
        total_flights: row.get("total_flights")?,
        flights_won: row.get("flights_won")?,
        total_wagered: row.get("total_wagered")?,
        total_won: row.get("total_won")?,
        best_multiplier: row.get("best_multiplier")?,
        auto_cash_out: serde_json::from_str(&auto_cash_out)
            .unwrap_or(serde_json::Value::Null),
        is_deleted: row.get("is_deleted")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn find_user(conn: &Connection, user_id: &str) -> Result<Option<User>, StoreError> {
    conn.query_row(
        "SELECT * FROM users WHERE user_id = ?",
        params![user_id],
        row_to_user,
    )
    .optional()
    .map_err(map_sqlite)
}

fn find_or_create_user(conn: &Connection, user_id: &str, now_ms: u64) -> Result<User, StoreError> {
    if let Some(user) = find_user(conn, user_id)? {
        return Ok(user);
    }
    let user = User::new(user_id, now_ms);
    upsert_user(conn, &user)?;
    Ok(user)
}

fn upsert_user(conn: &Connection, user: &User) -> Result<(), StoreError> {
    let auto_cash_out =
        serde_json::to_string(&user.auto_cash_out).unwrap_or_else(|_| "null".to_string());
    conn.execute(
        "INSERT INTO users (user_id, balance, total_flights, flights_won, total_wagered,
                            total_won, best_multiplier, auto_cash_out, is_deleted,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(user_id) DO UPDATE SET
             balance = excluded.balance,
             total_flights = excluded.total_flights,
             flights_won = excluded.flights_won,
             total_wagered = excluded.total_wagered,
             total_won = excluded.total_won,
             best_multiplier = excluded.best_multiplier,
             auto_cash_out = excluded.auto_cash_out,
             is_deleted = excluded.is_deleted,
             updated_at = excluded.updated_at",
        params![
            user.user_id,
            user.balance,
            user.total_flights,
            user.flights_won,
            user.total_wagered,
            user.total_won,
            user.best_multiplier,
            auto_cash_out,
            user.is_deleted,
            user.created_at,
            user.updated_at,
        ],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn soft_delete_user(conn: &Connection, user_id: &str, now_ms: u64) -> Result<(), StoreError> {
    let changed = conn
        .execute(
            "UPDATE users SET is_deleted = 1, updated_at = ?2 WHERE user_id = ?1",
            params![user_id, now_ms],
        )
        .map_err(map_sqlite)?;
    if changed == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

fn top_users(conn: &Connection, limit: usize) -> Result<Vec<User>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM users WHERE is_deleted = 0
             ORDER BY total_won DESC, flights_won DESC, user_id ASC LIMIT ?",
        )
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![limit], row_to_user)
        .map_err(map_sqlite)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
}

fn insert_sessions_bulk(
    conn: &Connection,
    sessions: Vec<GameSession>,
) -> Result<BulkOutcome<GameSession>, StoreError> {
    let mut outcome = BulkOutcome::default();
    for session in sessions {
        let result = conn.execute(
            "INSERT INTO sessions (session_id, race_id, user_id, bet_amount, crash_multiplier,
                                   cash_out_multiplier, is_win, win_amount, profit,
                                   game_start_time, game_end_time, game_duration,
                                   is_free_mode, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                session.session_id,
                session.race_id,
                session.user_id,
                session.bet_amount,
                session.crash_multiplier,
                session.cash_out_multiplier,
                session.is_win,
                session.win_amount,
                session.profit,
                session.game_start_time,
                session.game_end_time,
                session.game_duration,
                session.is_free_mode,
                session.timestamp,
            ],
        );
        match result {
            Ok(_) => outcome.inserted += 1,
            Err(err) if is_duplicate(&err) => outcome.duplicates += 1,
            Err(err) => {
                warn!(session_id = %session.session_id, "Session insert failed: {err}");
                outcome.failed.push(session);
            }
        }
    }
    Ok(outcome)
}

fn bulk_upsert_participants(
    conn: &Connection,
    rows: Vec<RaceParticipant>,
) -> Result<(), StoreError> {
    conn.execute_batch("BEGIN").map_err(map_sqlite)?;
    for row in &rows {
        let result = conn.execute(
            "INSERT INTO participants (race_id, user_id, total_bet_amount, total_win_amount,
                                       net_profit, contribution_to_pool, session_count,
                                       user_rank, last_update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(race_id, user_id) DO UPDATE SET
                 total_bet_amount = excluded.total_bet_amount,
                 total_win_amount = excluded.total_win_amount,
                 net_profit = excluded.net_profit,
                 contribution_to_pool = excluded.contribution_to_pool,
                 session_count = excluded.session_count,
                 user_rank = excluded.user_rank,
                 last_update_time = excluded.last_update_time",
            params![
                row.race_id,
                row.user_id,
                row.total_bet_amount,
                row.total_win_amount,
                row.net_profit,
                row.contribution_to_pool,
                row.session_count,
                row.rank,
                row.last_update_time,
            ],
        );
        if let Err(err) = result {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(map_sqlite(err));
        }
    }
    conn.execute_batch("COMMIT").map_err(map_sqlite)?;
    Ok(())
}

fn row_to_race(row: &rusqlite::Row<'_>) -> rusqlite::Result<Race> {
    let status: String = row.get("status")?;
    Ok(Race {
        race_id: row.get("race_id")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        actual_end_time: row.get("actual_end_time")?,
        status: RaceStatus::parse(&status).unwrap_or(RaceStatus::Cancelled),
        final_prize_pool: row.get("final_prize_pool")?,
        final_contribution: row.get("final_contribution")?,
        total_participants: row.get("total_participants")?,
        finalized_at: row.get("finalized_at")?,
    })
}

fn insert_race(conn: &Connection, race: &Race) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO races (race_id, start_time, end_time, actual_end_time, status,
                            final_prize_pool, final_contribution, total_participants,
                            finalized_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            race.race_id,
            race.start_time,
            race.end_time,
            race.actual_end_time,
            race.status.as_str(),
            race.final_prize_pool,
            race.final_contribution,
            race.total_participants,
            race.finalized_at,
        ],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn update_race(conn: &Connection, race_id: &str, patch: RaceUpdate) -> Result<(), StoreError> {
    let existing = conn
        .query_row(
            "SELECT * FROM races WHERE race_id = ?",
            params![race_id],
            row_to_race,
        )
        .optional()
        .map_err(map_sqlite)?;
    let Some(mut race) = existing else {
        return Err(StoreError::NotFound);
    };

    if let Some(status) = patch.status {
        race.status = status;
    }
    if let Some(actual_end_time) = patch.actual_end_time {
        race.actual_end_time = Some(actual_end_time);
    }
    if let Some(final_prize_pool) = patch.final_prize_pool {
        race.final_prize_pool = final_prize_pool;
    }
    if let Some(final_contribution) = patch.final_contribution {
        race.final_contribution = final_contribution;
    }
    if let Some(total_participants) = patch.total_participants {
        race.total_participants = total_participants;
    }
    if let Some(finalized_at) = patch.finalized_at {
        race.finalized_at = Some(finalized_at);
    }

    conn.execute(
        "UPDATE races SET start_time = ?2, end_time = ?3, actual_end_time = ?4, status = ?5,
                          final_prize_pool = ?6, final_contribution = ?7,
                          total_participants = ?8, finalized_at = ?9
         WHERE race_id = ?1",
        params![
            race.race_id,
            race.start_time,
            race.end_time,
            race.actual_end_time,
            race.status.as_str(),
            race.final_prize_pool,
            race.final_contribution,
            race.total_participants,
            race.finalized_at,
        ],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn find_active_race(conn: &Connection) -> Result<Option<Race>, StoreError> {
    conn.query_row(
        "SELECT * FROM races WHERE status = 'active' ORDER BY start_time DESC LIMIT 1",
        [],
        row_to_race,
    )
    .optional()
    .map_err(map_sqlite)
}

fn find_race_history(conn: &Connection, limit: usize) -> Result<Vec<Race>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM races WHERE status IN ('completed', 'cancelled')
             ORDER BY start_time DESC LIMIT ?",
        )
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![limit], row_to_race)
        .map_err(map_sqlite)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<RaceParticipant> {
    Ok(RaceParticipant {
        race_id: row.get("race_id")?,
        user_id: row.get("user_id")?,
        total_bet_amount: row.get("total_bet_amount")?,
        total_win_amount: row.get("total_win_amount")?,
        net_profit: row.get("net_profit")?,
        contribution_to_pool: row.get("contribution_to_pool")?,
        session_count: row.get("session_count")?,
        rank: row.get("user_rank")?,
        last_update_time: row.get("last_update_time")?,
    })
}

fn find_participants(conn: &Connection, race_id: &str) -> Result<Vec<RaceParticipant>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM participants WHERE race_id = ?
             ORDER BY contribution_to_pool DESC, user_id ASC",
        )
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![race_id], row_to_participant)
        .map_err(map_sqlite)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<GameSession> {
    Ok(GameSession {
        session_id: row.get("session_id")?,
        race_id: row.get("race_id")?,
        user_id: row.get("user_id")?,
        bet_amount: row.get("bet_amount")?,
        crash_multiplier: row.get("crash_multiplier")?,
        cash_out_multiplier: row.get("cash_out_multiplier")?,
        is_win: row.get("is_win")?,
        win_amount: row.get("win_amount")?,
        profit: row.get("profit")?,
        game_start_time: row.get("game_start_time")?,
        game_end_time: row.get("game_end_time")?,
        game_duration: row.get("game_duration")?,
        is_free_mode: row.get("is_free_mode")?,
        timestamp: row.get("timestamp")?,
    })
}

fn find_recent_sessions(
    conn: &Connection,
    race_id: &str,
    limit: usize,
) -> Result<Vec<GameSession>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM sessions WHERE race_id = ? ORDER BY timestamp DESC LIMIT ?")
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![race_id, limit], row_to_session)
        .map_err(map_sqlite)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
}

fn row_to_prize(row: &rusqlite::Row<'_>) -> rusqlite::Result<RacePrize> {
    let status: String = row.get("status")?;
    Ok(RacePrize {
        prize_id: row.get("prize_id")?,
        race_id: row.get("race_id")?,
        user_id: row.get("user_id")?,
        rank: row.get("user_rank")?,
        prize_amount: row.get("prize_amount")?,
        percentage: row.get("percentage")?,
        status: PrizeStatus::parse(&status).unwrap_or(PrizeStatus::Pending),
        credited: row.get("credited")?,
        created_at: row.get("created_at")?,
        claimed_at: row.get("claimed_at")?,
        contribution: row.get("contribution")?,
        net_profit: row.get("net_profit")?,
        session_count: row.get("session_count")?,
    })
}

fn insert_prize_stmt(conn: &Connection, prize: &RacePrize) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO prizes (prize_id, race_id, user_id, user_rank, prize_amount, percentage,
                             status, credited, created_at, claimed_at, contribution,
                             net_profit, session_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            prize.prize_id,
            prize.race_id,
            prize.user_id,
            prize.rank,
            prize.prize_amount,
            prize.percentage,
            prize.status.as_str(),
            prize.credited,
            prize.created_at,
            prize.claimed_at,
            prize.contribution,
            prize.net_profit,
            prize.session_count,
        ],
    )
}

fn insert_prize(conn: &Connection, prize: &RacePrize) -> Result<(), StoreError> {
    insert_prize_stmt(conn, prize).map_err(map_sqlite)?;
    Ok(())
}

fn insert_prizes(
    conn: &Connection,
    prizes: Vec<RacePrize>,
) -> Result<BulkOutcome<RacePrize>, StoreError> {
    let mut outcome = BulkOutcome::default();
    for prize in prizes {
        match insert_prize_stmt(conn, &prize) {
            Ok(_) => outcome.inserted += 1,
            Err(err) if is_duplicate(&err) => outcome.duplicates += 1,
            Err(err) => {
                warn!(prize_id = %prize.prize_id, "Prize insert failed: {err}");
                outcome.failed.push(prize);
            }
        }
    }
    Ok(outcome)
}

fn find_user_prizes(
    conn: &Connection,
    user_id: &str,
    status: Option<PrizeStatus>,
    limit: usize,
) -> Result<Vec<RacePrize>, StoreError> {
    match status {
        Some(status) => {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM prizes WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC LIMIT ?3",
                )
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(params![user_id, status.as_str(), limit], row_to_prize)
                .map_err(map_sqlite)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT * FROM prizes WHERE user_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(params![user_id, limit], row_to_prize)
                .map_err(map_sqlite)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
        }
    }
}

fn find_prizes_by_race(conn: &Connection, race_id: &str) -> Result<Vec<RacePrize>, StoreError> {
    let mut stmt = conn
        .prepare("SELECT * FROM prizes WHERE race_id = ? ORDER BY user_rank ASC")
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![race_id], row_to_prize)
        .map_err(map_sqlite)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_sqlite)
}

fn claim_prize(
    conn: &Connection,
    prize_id: &str,
    user_id: &str,
    now_ms: u64,
) -> Result<RacePrize, StoreError> {
    conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqlite)?;
    let result = claim_prize_inner(conn, prize_id, user_id, now_ms);
    match &result {
        Ok(_) => conn.execute_batch("COMMIT").map_err(map_sqlite)?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

fn claim_prize_inner(
    conn: &Connection,
    prize_id: &str,
    user_id: &str,
    now_ms: u64,
) -> Result<RacePrize, StoreError> {
    let prize = conn
        .query_row(
            "SELECT * FROM prizes WHERE prize_id = ?",
            params![prize_id],
            row_to_prize,
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or(StoreError::NotFound)?;

    if prize.user_id != user_id {
        return Err(StoreError::Forbidden);
    }
    if prize.status == PrizeStatus::Claimed {
        return Err(StoreError::AlreadyClaimed);
    }

    let changed = conn
        .execute(
            "UPDATE prizes SET status = 'claimed', claimed_at = ?2, credited = 1
             WHERE prize_id = ?1 AND status = 'pending'",
            params![prize_id, now_ms],
        )
        .map_err(map_sqlite)?;
    if changed == 0 {
        return Err(StoreError::AlreadyClaimed);
    }

    if !prize.credited {
        let credited = conn
            .execute(
                "UPDATE users SET balance = balance + ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id, prize.prize_amount, now_ms],
            )
            .map_err(map_sqlite)?;
        if credited == 0 {
            warn!(%prize_id, %user_id, "Prize claim credit skipped: user missing");
        }
    }

    let mut claimed = prize;
    claimed.status = PrizeStatus::Claimed;
    claimed.claimed_at = Some(now_ms);
    claimed.credited = true;
    Ok(claimed)
}

fn credit_prize(
    conn: &Connection,
    prize_id: &str,
    user_id: &str,
    now_ms: u64,
) -> Result<CreditOutcome, StoreError> {
    conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqlite)?;
    let result = credit_prize_inner(conn, prize_id, user_id, now_ms);
    match &result {
        Ok(_) => conn.execute_batch("COMMIT").map_err(map_sqlite)?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

fn credit_prize_inner(
    conn: &Connection,
    prize_id: &str,
    user_id: &str,
    now_ms: u64,
) -> Result<CreditOutcome, StoreError> {
    let exists: Option<u64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite)?;
    if exists.is_none() {
        return Ok(CreditOutcome::UserMissing);
    }

    let amount: Option<u64> = conn
        .query_row(
            "SELECT prize_amount FROM prizes WHERE prize_id = ?1 AND user_id = ?2 AND credited = 0",
            params![prize_id, user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite)?;
    let Some(amount) = amount else {
        return Ok(CreditOutcome::AlreadyCredited);
    };

    conn.execute(
        "UPDATE prizes SET credited = 1 WHERE prize_id = ?1 AND user_id = ?2 AND credited = 0",
        params![prize_id, user_id],
    )
    .map_err(map_sqlite)?;
    conn.execute(
        "UPDATE users SET balance = balance + ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, amount, now_ms],
    )
    .map_err(map_sqlite)?;
    Ok(CreditOutcome::Credited)
}

fn race_stats(conn: &Connection) -> Result<RaceStatsRow, StoreError> {
    let (total_races, completed_races): (u64, u64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'completed'), 0) FROM races",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(map_sqlite)?;
    let (total_prizes, total_prize_amount, pending_prizes): (u64, u64, u64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(prize_amount), 0),
                    COALESCE(SUM(status = 'pending'), 0)
             FROM prizes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(map_sqlite)?;
    Ok(RaceStatsRow {
        total_races,
        completed_races,
        total_prizes,
        total_prize_amount,
        pending_prizes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use updraft_types::SessionInput;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(&dir.path().join("updraft.db")).expect("open store");
        (dir, store)
    }

    fn session(session_id: &str, user_id: &str, win: f64) -> GameSession {
        let input = SessionInput {
            user_id: user_id.to_string(),
            bet_amount: 100,
            crash_multiplier: 3.0,
            cash_out_multiplier: if win > 0.0 { 2.0 } else { 0.0 },
            win_amount: win,
            game_start_time: 1_000,
            game_end_time: 2_000,
            is_free_mode: false,
        };
        GameSession::from_input(input, session_id.to_string(), "race_1".to_string(), 5_000)
    }

    fn prize(prize_id: &str, user_id: &str, amount: u64) -> RacePrize {
        RacePrize {
            prize_id: prize_id.to_string(),
            race_id: "race_1".to_string(),
            user_id: user_id.to_string(),
            rank: 1,
            prize_amount: amount,
            percentage: 0.5,
            status: PrizeStatus::Pending,
            credited: false,
            created_at: 1_000,
            claimed_at: None,
            contribution: 100.0,
            net_profit: 50.0,
            session_count: 3,
        }
    }

    #[tokio::test]
    async fn user_round_trip_and_soft_delete() {
        let (_dir, store) = temp_store();

        let user = store.find_or_create_user("player_1", 42).await.unwrap();
        assert_eq!(user.created_at, 42);

        let mut user = store.find_or_create_user("player_1", 99).await.unwrap();
        assert_eq!(user.created_at, 42, "second lookup returns the same record");

        user.credit(500);
        user.record_flight(true, 100, 250.0, 2.5);
        store.upsert_user(user.clone()).await.unwrap();
        let loaded = store.find_user("player_1").await.unwrap().unwrap();
        assert_eq!(loaded, user);

        store.soft_delete_user("player_1", 100).await.unwrap();
        let loaded = store.find_user("player_1").await.unwrap().unwrap();
        assert!(loaded.is_deleted);
        assert!(matches!(
            store.soft_delete_user("missing_user", 100).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn bulk_session_insert_continues_past_duplicates() {
        let (_dir, store) = temp_store();

        let outcome = store
            .insert_sessions_bulk(vec![
                session("s1", "player_1", 200.0),
                session("s2", "player_2", 0.0),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 2);

        let outcome = store
            .insert_sessions_bulk(vec![
                session("s2", "player_2", 0.0),
                session("s3", "player_3", 150.0),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
        assert!(outcome.failed.is_empty());

        let recent = store.find_recent_sessions("race_1", 10).await.unwrap();
        assert_eq!(recent.len(), 3);
    }

    #[tokio::test]
    async fn race_lifecycle_round_trip() {
        let (_dir, store) = temp_store();

        let race = Race::new("race_20260101000000".to_string(), 1_000);
        store.insert_race(race.clone()).await.unwrap();

        let active = store.find_active_race().await.unwrap().unwrap();
        assert_eq!(active.race_id, race.race_id);

        store
            .update_race(
                &race.race_id,
                RaceUpdate {
                    status: Some(RaceStatus::Completed),
                    actual_end_time: Some(2_000),
                    final_prize_pool: Some(50_000.0),
                    final_contribution: Some(2_180.0),
                    total_participants: Some(11),
                    finalized_at: Some(2_000),
                },
            )
            .await
            .unwrap();

        assert!(store.find_active_race().await.unwrap().is_none());
        let history = store.find_race_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RaceStatus::Completed);
        assert_eq!(history[0].final_prize_pool, 50_000.0);
    }

    #[tokio::test]
    async fn participant_upsert_is_keyed_by_race_and_user() {
        let (_dir, store) = temp_store();

        let mut row = RaceParticipant::new("race_1".to_string(), "player_1".to_string(), 0);
        row.contribution_to_pool = 10.0;
        store.bulk_upsert_participants(vec![row.clone()]).await.unwrap();

        row.contribution_to_pool = 25.0;
        let mut other = RaceParticipant::new("race_1".to_string(), "player_2".to_string(), 0);
        other.contribution_to_pool = 40.0;
        store
            .bulk_upsert_participants(vec![row, other])
            .await
            .unwrap();

        let rows = store.find_participants("race_1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, "player_2");
        assert_eq!(rows[1].contribution_to_pool, 25.0);
    }

    #[tokio::test]
    async fn claim_is_a_one_shot_cas() {
        let (_dir, store) = temp_store();
        store.find_or_create_user("winner_1", 0).await.unwrap();
        store.insert_prize(prize("p1", "winner_1", 25_000)).await.unwrap();

        let claimed = store.claim_prize("p1", "winner_1", 9_000).await.unwrap();
        assert_eq!(claimed.status, PrizeStatus::Claimed);
        assert_eq!(claimed.claimed_at, Some(9_000));

        assert!(matches!(
            store.claim_prize("p1", "winner_1", 9_001).await,
            Err(StoreError::AlreadyClaimed)
        ));
        assert!(matches!(
            store.claim_prize("p1", "intruder_1", 9_002).await,
            Err(StoreError::Forbidden)
        ));
        assert!(matches!(
            store.claim_prize("missing", "winner_1", 9_003).await,
            Err(StoreError::NotFound)
        ));

        let user = store.find_user("winner_1").await.unwrap().unwrap();
        assert_eq!(user.balance, 25_000);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_success() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.find_or_create_user("winner_1", 0).await.unwrap();
        store.insert_prize(prize("p1", "winner_1", 10_000)).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_prize("p1", "winner_1", 1).await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.claim_prize("p1", "winner_1", 2).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::AlreadyClaimed)))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(already, 1);

        // Balance moved exactly once.
        let user = store.find_user("winner_1").await.unwrap().unwrap();
        assert_eq!(user.balance, 10_000);
    }

    #[tokio::test]
    async fn settlement_credit_is_idempotent_with_claim() {
        let (_dir, store) = temp_store();
        store.find_or_create_user("winner_1", 0).await.unwrap();
        store.insert_prize(prize("p1", "winner_1", 5_000)).await.unwrap();

        assert_eq!(
            store.credit_prize("p1", "winner_1", 10).await.unwrap(),
            CreditOutcome::Credited
        );
        assert_eq!(
            store.credit_prize("p1", "winner_1", 11).await.unwrap(),
            CreditOutcome::AlreadyCredited
        );

        // A later claim flips status without paying again.
        let claimed = store.claim_prize("p1", "winner_1", 12).await.unwrap();
        assert_eq!(claimed.status, PrizeStatus::Claimed);
        let user = store.find_user("winner_1").await.unwrap().unwrap();
        assert_eq!(user.balance, 5_000);

        assert_eq!(
            store.credit_prize("p2", "ghost_user", 13).await.unwrap(),
            CreditOutcome::UserMissing
        );
    }

    #[tokio::test]
    async fn prize_queries_filter_by_status_and_race() {
        let (_dir, store) = temp_store();
        store.find_or_create_user("winner_1", 0).await.unwrap();

        let mut second = prize("p2", "winner_1", 1_000);
        second.race_id = "race_2".to_string();
        second.rank = 4;
        store.insert_prize(prize("p1", "winner_1", 25_000)).await.unwrap();
        store.insert_prize(second).await.unwrap();

        store.claim_prize("p1", "winner_1", 50).await.unwrap();

        let pending = store.find_user_pending_prizes("winner_1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prize_id, "p2");

        let history = store.find_user_prize_history("winner_1", 10).await.unwrap();
        assert_eq!(history.len(), 2);

        let by_race = store.find_prizes_by_race("race_1").await.unwrap();
        assert_eq!(by_race.len(), 1);
        assert_eq!(by_race[0].status, PrizeStatus::Claimed);

        let stats = store.race_stats().await.unwrap();
        assert_eq!(stats.total_prizes, 2);
        assert_eq!(stats.pending_prizes, 1);
        assert_eq!(stats.total_prize_amount, 26_000);
    }

    #[tokio::test]
    async fn duplicate_race_user_prizes_are_rejected() {
        let (_dir, store) = temp_store();
        store.insert_prize(prize("p1", "winner_1", 100)).await.unwrap();

        let outcome = store
            .insert_prizes(vec![prize("p_dup", "winner_1", 100), prize("p3", "other_u1", 50)])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
    }
}
