use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use updraft_types::ValidationError;

use crate::metrics::CoreMetrics;
use crate::multiplier::MultiplierGenerator;
use crate::now_ms;

pub const MIN_COUNTDOWN_MS: u64 = 5_000;
pub const MAX_COUNTDOWN_MS: u64 = 1_800_000;
pub const MAX_FIXED_MULTIPLIER: f64 = 1_000.0;
/// Fixed multipliers in (0, 1.01) would make every round crash instantly.
pub const MIN_FIXED_MULTIPLIER: f64 = 1.01;

const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Betting,
    Gaming,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownConfig {
    pub betting_countdown_ms: u64,
    pub game_countdown_ms: u64,
    /// Greater than zero pins every round to this value; zero or less draws
    /// from the weighted distribution each round.
    pub fixed_crash_multiplier: f64,
    pub auto_start: bool,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            betting_countdown_ms: 15_000,
            game_countdown_ms: 30_000,
            fixed_crash_multiplier: 0.0,
            auto_start: true,
        }
    }
}

impl CountdownConfig {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<CountdownConfig>(&raw) {
                Ok(config) => config.sanitized(),
                Err(err) => {
                    tracing::warn!(path = %path.display(), "Countdown config invalid, using defaults: {err}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    fn sanitized(mut self) -> Self {
        self.betting_countdown_ms = self
            .betting_countdown_ms
            .clamp(MIN_COUNTDOWN_MS, MAX_COUNTDOWN_MS);
        self.game_countdown_ms = self
            .game_countdown_ms
            .clamp(MIN_COUNTDOWN_MS, MAX_COUNTDOWN_MS);
        if !(0.0..=MAX_FIXED_MULTIPLIER).contains(&self.fixed_crash_multiplier)
            || (self.fixed_crash_multiplier > 0.0
                && self.fixed_crash_multiplier < MIN_FIXED_MULTIPLIER)
        {
            self.fixed_crash_multiplier = 0.0;
        }
        self
    }
}

/// Runtime update applied through the config endpoint. Validation rejects;
/// this is not an ingest path.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub betting_countdown: Option<u64>,
    pub game_countdown: Option<u64>,
    pub crash_multiplier: Option<f64>,
    pub auto_start: Option<bool>,
}

fn validate_countdown(field: &'static str, value: u64) -> Result<(), ValidationError> {
    if !(MIN_COUNTDOWN_MS..=MAX_COUNTDOWN_MS).contains(&value) {
        return Err(ValidationError::new(
            field,
            format!("must be in [{MIN_COUNTDOWN_MS}, {MAX_COUNTDOWN_MS}] ms, got {value}"),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RoundEvent {
    BettingCountdownStarted {
        round: u64,
        game_id: String,
        ends_at: u64,
    },
    BettingPhaseEnded {
        round: u64,
        game_id: String,
    },
    GameCountdownStarted {
        round: u64,
        game_id: String,
        crash_multiplier: f64,
        ends_at: u64,
    },
    GamePhaseEnded {
        round: u64,
        game_id: String,
        crash_multiplier: f64,
    },
    CountdownStopped {
        round: u64,
    },
    ConfigUpdated {
        config: CountdownConfig,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub phase: Phase,
    pub is_counting_down: bool,
    pub countdown_start_time: u64,
    pub countdown_end_time: u64,
    pub remaining_ms: u64,
    pub game_id: String,
    pub round: u64,
    pub current_game_crash_multiplier: f64,
}

struct RoundState {
    phase: Phase,
    countdown_start_time: u64,
    countdown_end_time: u64,
    game_id: String,
    round: u64,
    crash_multiplier: f64,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            countdown_start_time: 0,
            countdown_end_time: 0,
            game_id: String::new(),
            round: 0,
            crash_multiplier: 0.0,
        }
    }
}

/// The perpetual two-phase round clock. A single driver task owns all phase
/// transitions; `stop()` invalidates the driver's epoch so a stale timer can
/// never fire into a newer run.
pub struct RoundOrchestrator {
    state: Mutex<RoundState>,
    config: Mutex<CountdownConfig>,
    config_path: PathBuf,
    epoch: AtomicU64,
    events: broadcast::Sender<RoundEvent>,
    // Keeps the channel open with zero subscribers.
    #[allow(dead_code)]
    _events_rx: broadcast::Receiver<RoundEvent>,
    generator: Arc<MultiplierGenerator>,
    save_notify: Notify,
    saver_started: AtomicBool,
    metrics: Arc<CoreMetrics>,
}

impl RoundOrchestrator {
    pub fn new(
        generator: Arc<MultiplierGenerator>,
        config_path: PathBuf,
        metrics: Arc<CoreMetrics>,
    ) -> Self {
        let (events, events_rx) = broadcast::channel(EVENT_BUFFER);
        let config = CountdownConfig::load(&config_path);
        Self {
            state: Mutex::new(RoundState::default()),
            config: Mutex::new(config),
            config_path,
            epoch: AtomicU64::new(0),
            events,
            _events_rx: events_rx,
            generator,
            save_notify: Notify::new(),
            saver_started: AtomicBool::new(false),
            metrics,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RoundState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Round state lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_config(&self) -> MutexGuard<'_, CountdownConfig> {
        match self.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Round config lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn config_snapshot(&self) -> CountdownConfig {
        *self.lock_config()
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        let state = self.lock_state();
        let is_counting_down = state.phase != Phase::Idle;
        RoundSnapshot {
            phase: state.phase,
            is_counting_down,
            countdown_start_time: state.countdown_start_time,
            countdown_end_time: state.countdown_end_time,
            remaining_ms: if is_counting_down {
                state.countdown_end_time.saturating_sub(now_ms())
            } else {
                0
            },
            game_id: state.game_id.clone(),
            round: state.round,
            current_game_crash_multiplier: state.crash_multiplier,
        }
    }

    /// Apply a runtime config update. In-flight phases keep their deadline;
    /// the new values take effect from the next phase entry.
    pub fn update_config(&self, patch: ConfigPatch) -> Result<CountdownConfig, ValidationError> {
        if let Some(value) = patch.betting_countdown {
            validate_countdown("bettingCountdown", value)?;
        }
        if let Some(value) = patch.game_countdown {
            validate_countdown("gameCountdown", value)?;
        }
        if let Some(value) = patch.crash_multiplier {
            if !(0.0..=MAX_FIXED_MULTIPLIER).contains(&value) {
                return Err(ValidationError::new(
                    "crashMultiplier",
                    format!("must be in [0, {MAX_FIXED_MULTIPLIER}], got {value}"),
                ));
            }
            if value > 0.0 && value < MIN_FIXED_MULTIPLIER {
                return Err(ValidationError::new(
                    "crashMultiplier",
                    format!("values in (0, {MIN_FIXED_MULTIPLIER}) are rejected"),
                ));
            }
        }

        let updated = {
            let mut config = self.lock_config();
            if let Some(value) = patch.betting_countdown {
                config.betting_countdown_ms = value;
            }
            if let Some(value) = patch.game_countdown {
                config.game_countdown_ms = value;
            }
            if let Some(value) = patch.crash_multiplier {
                config.fixed_crash_multiplier = value;
            }
            if let Some(value) = patch.auto_start {
                config.auto_start = value;
            }
            *config
        };

        let _ = self.events.send(RoundEvent::ConfigUpdated { config: updated });
        self.save_notify.notify_one();
        Ok(updated)
    }

    /// Synchronous config write; also the shutdown path for any pending
    /// debounced save.
    pub fn save_config_now(&self) -> std::io::Result<()> {
        let config = *self.lock_config();
        let raw = serde_json::to_string_pretty(&config)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(&self.config_path, raw)
    }

    pub fn start(self: &Arc<Self>) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run(epoch).await });

        if !self.saver_started.swap(true, Ordering::SeqCst) {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move { orchestrator.save_loop().await });
        }
    }

    /// Transition to idle and cancel the pending phase timer. The current
    /// `game_id` is not rolled back.
    pub fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let round = {
            let mut state = self.lock_state();
            state.phase = Phase::Idle;
            state.countdown_start_time = 0;
            state.countdown_end_time = 0;
            state.round
        };
        let _ = self.events.send(RoundEvent::CountdownStopped { round });
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        loop {
            let config = self.config_snapshot();
            let Some(betting) = self.enter_betting(epoch, &config) else {
                return;
            };
            tokio::time::sleep(betting).await;
            if !self.end_betting(epoch) {
                return;
            }

            let config = self.config_snapshot();
            let Some(gaming) = self.enter_gaming(epoch, &config) else {
                return;
            };
            tokio::time::sleep(gaming).await;
            if !self.end_gaming(epoch, config.auto_start) {
                return;
            }
        }
    }

    fn enter_betting(&self, epoch: u64, config: &CountdownConfig) -> Option<Duration> {
        if !self.is_current(epoch) {
            return None;
        }
        let now = now_ms();
        let (round, game_id, ends_at) = {
            let mut state = self.lock_state();
            state.phase = Phase::Betting;
            state.round += 1;
            state.game_id = Uuid::new_v4().to_string();
            state.countdown_start_time = now;
            state.countdown_end_time = now + config.betting_countdown_ms;
            (state.round, state.game_id.clone(), state.countdown_end_time)
        };
        self.metrics.inc_round_started();
        tracing::debug!(round, game_id = %game_id, "Betting countdown started");
        let _ = self.events.send(RoundEvent::BettingCountdownStarted {
            round,
            game_id,
            ends_at,
        });
        Some(Duration::from_millis(config.betting_countdown_ms))
    }

    fn end_betting(&self, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        let (round, game_id) = {
            let state = self.lock_state();
            (state.round, state.game_id.clone())
        };
        let _ = self
            .events
            .send(RoundEvent::BettingPhaseEnded { round, game_id });
        true
    }

    fn enter_gaming(&self, epoch: u64, config: &CountdownConfig) -> Option<Duration> {
        if !self.is_current(epoch) {
            return None;
        }
        let crash_multiplier = if config.fixed_crash_multiplier > 0.0 {
            config.fixed_crash_multiplier
        } else {
            self.generator.draw()
        };
        let now = now_ms();
        let (round, game_id, ends_at) = {
            let mut state = self.lock_state();
            state.phase = Phase::Gaming;
            state.crash_multiplier = crash_multiplier;
            state.countdown_start_time = now;
            state.countdown_end_time = now + config.game_countdown_ms;
            (state.round, state.game_id.clone(), state.countdown_end_time)
        };
        tracing::debug!(round, crash_multiplier, "Game countdown started");
        let _ = self.events.send(RoundEvent::GameCountdownStarted {
            round,
            game_id,
            crash_multiplier,
            ends_at,
        });
        Some(Duration::from_millis(config.game_countdown_ms))
    }

    fn end_gaming(&self, epoch: u64, auto_start: bool) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        let (round, game_id, crash_multiplier) = {
            let mut state = self.lock_state();
            let snapshot = (
                state.round,
                state.game_id.clone(),
                state.crash_multiplier,
            );
            if !auto_start {
                state.phase = Phase::Idle;
                state.countdown_start_time = 0;
                state.countdown_end_time = 0;
            }
            snapshot
        };
        let _ = self.events.send(RoundEvent::GamePhaseEnded {
            round,
            game_id,
            crash_multiplier,
        });
        auto_start
    }

    async fn save_loop(self: Arc<Self>) {
        loop {
            self.save_notify.notified().await;
            // Restart the debounce window on every further change.
            loop {
                let sleep = tokio::time::sleep(SAVE_DEBOUNCE);
                tokio::pin!(sleep);
                tokio::select! {
                    _ = self.save_notify.notified() => continue,
                    _ = &mut sleep => break,
                }
            }
            if let Err(err) = self.save_config_now() {
                tracing::warn!("Countdown config save failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplier::MultiplierConfig;

    fn orchestrator(dir: &tempfile::TempDir) -> Arc<RoundOrchestrator> {
        let generator = Arc::new(MultiplierGenerator::new(MultiplierConfig::fallback()));
        Arc::new(RoundOrchestrator::new(
            generator,
            dir.path().join("gameCountdownConfig.json"),
            Arc::new(CoreMetrics::default()),
        ))
    }

    fn fast_config() -> ConfigPatch {
        ConfigPatch {
            betting_countdown: Some(10_000),
            game_countdown: Some(20_000),
            crash_multiplier: Some(0.0),
            auto_start: Some(true),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn phases_cycle_and_round_increments() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator.update_config(fast_config()).unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start();

        let first = events.recv().await.unwrap();
        let RoundEvent::BettingCountdownStarted { round, game_id, .. } = first else {
            panic!("expected betting start, got {first:?}");
        };
        assert_eq!(round, 1);
        assert_eq!(orchestrator.snapshot().phase, Phase::Betting);

        let second = events.recv().await.unwrap();
        assert!(matches!(second, RoundEvent::BettingPhaseEnded { .. }));

        let third = events.recv().await.unwrap();
        let RoundEvent::GameCountdownStarted {
            crash_multiplier, ..
        } = third
        else {
            panic!("expected game start, got {third:?}");
        };
        assert!(crash_multiplier >= 1.0);
        assert_eq!(orchestrator.snapshot().phase, Phase::Gaming);

        let fourth = events.recv().await.unwrap();
        assert!(matches!(fourth, RoundEvent::GamePhaseEnded { .. }));

        let fifth = events.recv().await.unwrap();
        let RoundEvent::BettingCountdownStarted {
            round: next_round,
            game_id: next_game_id,
            ..
        } = fifth
        else {
            panic!("expected next betting start, got {fifth:?}");
        };
        assert_eq!(next_round, 2);
        assert_ne!(next_game_id, game_id, "every round gets a fresh game id");
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_multiplier_pins_every_round() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator
            .update_config(ConfigPatch {
                crash_multiplier: Some(4.2),
                ..fast_config()
            })
            .unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start();

        for _ in 0..2 {
            loop {
                match events.recv().await.unwrap() {
                    RoundEvent::GameCountdownStarted {
                        crash_multiplier, ..
                    } => {
                        assert_eq!(crash_multiplier, 4.2);
                        break;
                    }
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timer() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator.update_config(fast_config()).unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, RoundEvent::BettingCountdownStarted { .. }));
        let game_id_before = orchestrator.snapshot().game_id;

        orchestrator.stop();
        let stopped = events.recv().await.unwrap();
        assert!(matches!(stopped, RoundEvent::CountdownStopped { .. }));
        assert_eq!(orchestrator.snapshot().phase, Phase::Idle);
        // The current game id survives a stop.
        assert_eq!(orchestrator.snapshot().game_id, game_id_before);

        // The cancelled driver never fires another phase.
        let next = tokio::time::timeout(Duration::from_secs(120), events.recv()).await;
        assert!(next.is_err(), "no events after stop, got {next:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_false_parks_in_idle_after_gaming() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator
            .update_config(ConfigPatch {
                auto_start: Some(false),
                ..fast_config()
            })
            .unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start();

        loop {
            if matches!(
                events.recv().await.unwrap(),
                RoundEvent::GamePhaseEnded { .. }
            ) {
                break;
            }
        }
        assert_eq!(orchestrator.snapshot().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn config_updates_do_not_disturb_the_inflight_phase() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator.update_config(fast_config()).unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start();

        let _ = events.recv().await.unwrap();
        let before = orchestrator.snapshot();

        orchestrator
            .update_config(ConfigPatch {
                betting_countdown: Some(60_000),
                ..ConfigPatch::default()
            })
            .unwrap();

        let after = orchestrator.snapshot();
        assert_eq!(after.countdown_end_time, before.countdown_end_time);
        assert_eq!(after.round, before.round);
    }

    #[tokio::test]
    async fn config_validation_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);

        assert!(orchestrator
            .update_config(ConfigPatch {
                betting_countdown: Some(1_000),
                ..ConfigPatch::default()
            })
            .is_err());
        assert!(orchestrator
            .update_config(ConfigPatch {
                game_countdown: Some(3_600_000),
                ..ConfigPatch::default()
            })
            .is_err());
        assert!(orchestrator
            .update_config(ConfigPatch {
                crash_multiplier: Some(0.5),
                ..ConfigPatch::default()
            })
            .is_err());
        assert!(orchestrator
            .update_config(ConfigPatch {
                crash_multiplier: Some(1_500.0),
                ..ConfigPatch::default()
            })
            .is_err());
        // Zero re-enables random mode.
        assert!(orchestrator
            .update_config(ConfigPatch {
                crash_multiplier: Some(0.0),
                ..ConfigPatch::default()
            })
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn config_saves_are_debounced() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir);
        orchestrator.start();

        orchestrator
            .update_config(ConfigPatch {
                betting_countdown: Some(12_000),
                ..ConfigPatch::default()
            })
            .unwrap();
        orchestrator
            .update_config(ConfigPatch {
                game_countdown: Some(25_000),
                ..ConfigPatch::default()
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        // Let the saver task run after the debounce window.
        tokio::task::yield_now().await;

        let path = dir.path().join("gameCountdownConfig.json");
        let saved = CountdownConfig::load(&path);
        assert_eq!(saved.betting_countdown_ms, 12_000);
        assert_eq!(saved.game_countdown_ms, 25_000);
    }
}
