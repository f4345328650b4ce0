use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Latency histograms use power-of-two millisecond buckets: bucket `k`
/// counts requests that finished within `2^k` ms, anything slower than the
/// last bound lands in `over`. Totals are kept in microseconds so the mean
/// stays meaningful for sub-millisecond handlers.
const LATENCY_BUCKETS: usize = 11;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub slowest_ms: f64,
    pub bounds_ms: Vec<u64>,
    pub counts: Vec<u64>,
    pub over: u64,
}

#[derive(Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS],
    over: AtomicU64,
    count: AtomicU64,
    total_micros: AtomicU64,
    slowest_micros: AtomicU64,
}

fn bucket_for(ms: u64) -> Option<usize> {
    let idx = if ms <= 1 {
        0
    } else {
        (64 - (ms - 1).leading_zeros()) as usize
    };
    (idx < LATENCY_BUCKETS).then_some(idx)
}

impl LatencyHistogram {
    fn observe(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.slowest_micros.fetch_max(micros, Ordering::Relaxed);
        match bucket_for(elapsed.as_millis() as u64) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.over.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        let mean_ms = if count == 0 {
            0.0
        } else {
            total_micros as f64 / count as f64 / 1_000.0
        };
        LatencySnapshot {
            count,
            mean_ms,
            slowest_ms: self.slowest_micros.load(Ordering::Relaxed) as f64 / 1_000.0,
            bounds_ms: (0..LATENCY_BUCKETS).map(|k| 1u64 << k).collect(),
            counts: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            over: self.over.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpMetricsSnapshot {
    pub record_session: LatencySnapshot,
    pub countdown: LatencySnapshot,
    pub leaderboard: LatencySnapshot,
    pub claim: LatencySnapshot,
    pub reject_origin: u64,
    pub reject_rate_limit: u64,
    pub reject_body_limit: u64,
}

#[derive(Default)]
pub struct HttpMetrics {
    record_session: LatencyHistogram,
    countdown: LatencyHistogram,
    leaderboard: LatencyHistogram,
    claim: LatencyHistogram,
    reject_origin: AtomicU64,
    reject_rate_limit: AtomicU64,
    reject_body_limit: AtomicU64,
}

impl HttpMetrics {
    pub fn record_session(&self, duration: Duration) {
        self.record_session.observe(duration);
    }

    pub fn record_countdown(&self, duration: Duration) {
        self.countdown.observe(duration);
    }

    pub fn record_leaderboard(&self, duration: Duration) {
        self.leaderboard.observe(duration);
    }

    pub fn record_claim(&self, duration: Duration) {
        self.claim.observe(duration);
    }

    pub fn inc_reject_origin(&self) {
        self.reject_origin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_rate_limit(&self) {
        self.reject_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reject_body_limit(&self) {
        self.reject_body_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            record_session: self.record_session.snapshot(),
            countdown: self.countdown.snapshot(),
            leaderboard: self.leaderboard.snapshot(),
            claim: self.claim.snapshot(),
            reject_origin: self.reject_origin.load(Ordering::Relaxed),
            reject_rate_limit: self.reject_rate_limit.load(Ordering::Relaxed),
            reject_body_limit: self.reject_body_limit.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct CoreMetrics {
    sessions_ingested: AtomicU64,
    sessions_rejected_no_race: AtomicU64,
    sessions_dropped: AtomicU64,
    flush_failures: AtomicU64,
    participant_sync_failures: AtomicU64,
    rounds_started: AtomicU64,
    races_started: AtomicU64,
    races_ended: AtomicU64,
    prizes_granted: AtomicU64,
    prizes_claimed: AtomicU64,
    overrides_consumed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreMetricsSnapshot {
    pub sessions_ingested: u64,
    pub sessions_rejected_no_race: u64,
    pub sessions_dropped: u64,
    pub flush_failures: u64,
    pub participant_sync_failures: u64,
    pub rounds_started: u64,
    pub races_started: u64,
    pub races_ended: u64,
    pub prizes_granted: u64,
    pub prizes_claimed: u64,
    pub overrides_consumed: u64,
}

impl CoreMetrics {
    pub fn inc_session_ingested(&self) {
        self.sessions_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_session_rejected_no_race(&self) {
        self.sessions_rejected_no_race
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sessions_dropped(&self, dropped: u64) {
        self.sessions_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn inc_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_participant_sync_failure(&self) {
        self.participant_sync_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_round_started(&self) {
        self.rounds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_race_started(&self) {
        self.races_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_race_ended(&self) {
        self.races_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_prizes_granted(&self, granted: u64) {
        self.prizes_granted.fetch_add(granted, Ordering::Relaxed);
    }

    pub fn inc_prize_claimed(&self) {
        self.prizes_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_override_consumed(&self) {
        self.overrides_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoreMetricsSnapshot {
        CoreMetricsSnapshot {
            sessions_ingested: self.sessions_ingested.load(Ordering::Relaxed),
            sessions_rejected_no_race: self.sessions_rejected_no_race.load(Ordering::Relaxed),
            sessions_dropped: self.sessions_dropped.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            participant_sync_failures: self.participant_sync_failures.load(Ordering::Relaxed),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            races_started: self.races_started.load(Ordering::Relaxed),
            races_ended: self.races_ended.load(Ordering::Relaxed),
            prizes_granted: self.prizes_granted.load(Ordering::Relaxed),
            prizes_claimed: self.prizes_claimed.load(Ordering::Relaxed),
            overrides_consumed: self.overrides_consumed.load(Ordering::Relaxed),
        }
    }
}

/// Own-process resource usage for the telemetry routes. Samples are cached
/// for a couple of seconds so a hot stats endpoint cannot hammer procfs.
const PROCESS_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUsage {
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub cpu_percent: f32,
}

struct MonitorState {
    system: System,
    sampled_at: Option<Instant>,
    last: ProcessUsage,
}

pub struct ProcessMonitor {
    pid: Pid,
    state: Mutex<MonitorState>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            state: Mutex::new(MonitorState {
                system: System::new(),
                sampled_at: None,
                last: ProcessUsage::default(),
            }),
        }
    }

    pub fn usage(&self) -> ProcessUsage {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sampled_at) = state.sampled_at {
            if sampled_at.elapsed() < PROCESS_SAMPLE_INTERVAL {
                return state.last;
            }
        }

        state.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        let usage = state
            .system
            .process(self.pid)
            .map(|process| ProcessUsage {
                memory_bytes: process.memory(),
                virtual_memory_bytes: process.virtual_memory(),
                cpu_percent: process.cpu_usage(),
            })
            .unwrap_or_default();
        state.last = usage;
        state.sampled_at = Some(Instant::now());
        usage
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_double_per_step() {
        assert_eq!(bucket_for(0), Some(0));
        assert_eq!(bucket_for(1), Some(0));
        assert_eq!(bucket_for(2), Some(1));
        assert_eq!(bucket_for(3), Some(2));
        assert_eq!(bucket_for(4), Some(2));
        assert_eq!(bucket_for(1024), Some(10));
        assert_eq!(bucket_for(1025), None);
    }

    #[test]
    fn histogram_tracks_mean_and_slowest() {
        let histogram = LatencyHistogram::default();
        histogram.observe(Duration::from_millis(2));
        histogram.observe(Duration::from_millis(6));

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count, 2);
        assert!((snapshot.mean_ms - 4.0).abs() < 0.01);
        assert!((snapshot.slowest_ms - 6.0).abs() < 0.01);
        assert_eq!(snapshot.counts.iter().sum::<u64>(), 2);
        assert_eq!(snapshot.over, 0);

        histogram.observe(Duration::from_secs(5));
        assert_eq!(histogram.snapshot().over, 1);
    }

    #[test]
    fn process_monitor_reuses_recent_samples() {
        let monitor = ProcessMonitor::new();
        let first = monitor.usage();
        // Inside the sample window the cached value comes back untouched.
        let second = monitor.usage();
        assert_eq!(first.memory_bytes, second.memory_bytes);
        assert_eq!(first.cpu_percent, second.cpu_percent);
    }
}
