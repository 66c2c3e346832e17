//! Analysis engine
//!
//! Derives per-target baselines, window scores and the gated state label
//! from raw measurements. Everything here is a view over the store: given
//! the same raw and control rows, a rerun produces identical scores.
//!
//! Inference failures never reach the measurement layer; a failed run is
//! logged and the previous analysis stands.

use crate::clock::current_time_ms;
use crate::state::TrackedTarget;
use crate::stats;
use crate::store::MeasurementStore;
use crate::errors::StoreError;
use common::{
    AnalysisWindow, Baseline, Channel, Measurement, ServerEvent, TrackerState, UpdatePayload,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Rolling window the scores are computed over.
pub const ANALYSIS_WINDOW_MS: i64 = 60_000;
/// Periodic sweep over all tracked targets.
pub const SWEEP_INTERVAL_MS: u64 = 60_000;
/// Successful samples required before a baseline exists.
pub const BASELINE_MIN_SAMPLES: usize = 10;
/// Successful samples a baseline is computed over, newest first.
const BASELINE_SAMPLE_LIMIT: u32 = 1_000;

/// IQR of |target - local| that saturates the noise score.
const NOISE_FULL_SCALE_MS: f64 = 500.0;
/// Above this noise, confidence is forced to zero. Non-negotiable.
const NOISE_GATE: f64 = 0.5;
/// At or below this confidence the derived state is Unknown.
const CONFIDENCE_GATE: f64 = 0.6;
/// Confidence granted by the no-baseline fast path.
const FAST_PATH_CONFIDENCE: f64 = 0.8;
/// Every known-RTT sample must normalize below this for the fast path.
const FAST_PATH_LIMIT_MS: i64 = 1_000;
/// Windows smaller than this halve confidence.
const MIN_WINDOW_SAMPLES: usize = 3;
const NO_BASELINE_PENALTY: f64 = 0.1;
const SPARSE_WINDOW_PENALTY: f64 = 0.5;
/// Responsiveness above this reads as Online.
const ONLINE_RESPONSIVENESS: f64 = 0.8;

/// Scores for one analysis window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowScores {
    pub noise: f64,
    pub responsiveness: f64,
    pub confidence: f64,
    pub fast_path: bool,
    pub state: TrackerState,
    pub sample_count: usize,
}

/// Baseline over recent successful RTTs, or None below the sample floor.
pub fn compute_baseline(
    target_id: &str,
    channel: Channel,
    rtts: &[i64],
    now_ms: i64,
) -> Option<Baseline> {
    if rtts.len() < BASELINE_MIN_SAMPLES {
        return None;
    }
    let min = *rtts.iter().min()?;
    let median = stats::median(rtts)?;
    let (q1, q3) = stats::quartiles(rtts)?;
    Some(Baseline {
        target_id: target_id.to_string(),
        channel,
        min_rtt_ms: min,
        median_rtt_ms: median,
        iqr_ms: q3 - q1,
        updated_at_ms: now_ms,
        sample_count: rtts.len() as i64,
    })
}

/// IQR of |target - local| over rows where both are known, scaled to [0,1].
pub fn noise_score(rows: &[Measurement]) -> f64 {
    let diffs: Vec<i64> = rows
        .iter()
        .filter_map(|r| match (r.target_rtt_ms, r.local_network_rtt_ms) {
            (Some(target), Some(local)) => Some((target - local).abs()),
            _ => None,
        })
        .collect();
    if diffs.len() < 2 {
        return 0.0;
    }
    let iqr_d = stats::iqr(&diffs).unwrap_or(0) as f64;
    (iqr_d / NOISE_FULL_SCALE_MS).min(1.0)
}

/// Weighted share of samples meeting the baseline-relative threshold.
///
/// Timeouts count against the score; successful rows without a baseline to
/// judge them by are left out entirely.
pub fn responsiveness_score(rows: &[Measurement], baseline: Option<&Baseline>) -> f64 {
    let mut total = 0.0;
    let mut valid = 0u32;
    for row in rows {
        if row.timeout {
            valid += 1;
            continue;
        }
        let Some(target_rtt) = row.target_rtt_ms else {
            continue;
        };
        let Some(baseline) = baseline else {
            continue;
        };
        let local = row.local_network_rtt_ms.unwrap_or(0);
        let normalized = (target_rtt - local).max(0) as f64;
        let threshold = baseline.threshold();
        total += if normalized <= threshold {
            1.0
        } else if normalized <= 2.0 * threshold {
            0.5
        } else {
            0.1
        };
        valid += 1;
    }
    if valid > 0 {
        total / f64::from(valid)
    } else {
        0.0
    }
}

/// Score one window of raw rows against an optional baseline.
pub fn evaluate_window(rows: &[Measurement], baseline: Option<&Baseline>) -> WindowScores {
    let noise = noise_score(rows);
    let responsiveness = responsiveness_score(rows, baseline);
    let sample_count = rows.len();

    let mut confidence = 1.0;
    let mut fast_path = false;
    if baseline.is_none() {
        // timeouts do not disqualify the fast path; only known RTTs count
        let all_low = rows
            .iter()
            .filter_map(|r| {
                r.target_rtt_ms
                    .map(|target| target - r.local_network_rtt_ms.unwrap_or(0))
            })
            .all(|normalized| normalized < FAST_PATH_LIMIT_MS);
        if sample_count >= MIN_WINDOW_SAMPLES && all_low {
            confidence = FAST_PATH_CONFIDENCE;
            fast_path = true;
        } else {
            confidence *= NO_BASELINE_PENALTY;
        }
    }
    if noise > NOISE_GATE {
        confidence *= 0.0;
    }
    if sample_count < MIN_WINDOW_SAMPLES {
        confidence *= SPARSE_WINDOW_PENALTY;
    }

    let state = if confidence <= CONFIDENCE_GATE {
        TrackerState::Unknown
    } else if fast_path {
        // fast path wins even at responsiveness 0, which is all a
        // baseline-less window can score
        TrackerState::Online
    } else if responsiveness == 0.0 {
        TrackerState::Offline
    } else if responsiveness > ONLINE_RESPONSIVENESS {
        TrackerState::Online
    } else {
        // catch-all below Online; deliberately not refined further
        TrackerState::Standby
    };

    WindowScores {
        noise,
        responsiveness,
        confidence,
        fast_path,
        state,
        sample_count,
    }
}

pub struct AnalysisEngine {
    store: Arc<MeasurementStore>,
    updates_tx: broadcast::Sender<ServerEvent>,
    /// Read-through of the baselines table; never authoritative.
    baselines: Mutex<HashMap<String, Baseline>>,
    /// Per-target run serialization so the newest analysis row is
    /// deterministic when the sweep and a notification race.
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AnalysisEngine {
    pub fn new(store: Arc<MeasurementStore>, updates_tx: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            store,
            updates_tx,
            baselines: Mutex::new(HashMap::new()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_for_target(&self, target_id: &str, channel: Channel) {
        let lock = {
            self.run_locks
                .lock()
                .entry(target_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        if let Err(e) = self.run_inner(target_id, channel).await {
            tracing::warn!("analysis run failed for {}: {}", target_id, e);
        }
    }

    async fn run_inner(&self, target_id: &str, channel: Channel) -> Result<(), StoreError> {
        // baseline refresh over recent successful RTTs
        let rtts = self
            .store
            .get_recent_success_rtts(target_id, channel, BASELINE_SAMPLE_LIMIT)
            .await?;
        let now = current_time_ms();
        if let Some(baseline) = compute_baseline(target_id, channel, &rtts, now) {
            self.store.upsert_baseline(&baseline).await?;
            self.baselines
                .lock()
                .insert(target_id.to_string(), baseline);
        }

        let cached = { self.baselines.lock().get(target_id).cloned() };
        let baseline = match cached {
            Some(b) => Some(b),
            None => {
                let loaded = self.store.get_baseline(target_id).await?;
                if let Some(b) = &loaded {
                    self.baselines.lock().insert(target_id.to_string(), b.clone());
                }
                loaded
            }
        };

        let start_ms = now - ANALYSIS_WINDOW_MS;
        let rows = self
            .store
            .get_raw_in_window(target_id, channel, start_ms, now)
            .await?;
        let scores = evaluate_window(&rows, baseline.as_ref());

        let window = AnalysisWindow {
            start_ms,
            end_ms: now,
            target_id: target_id.to_string(),
            channel,
            sample_count: scores.sample_count as i64,
            noise_score: scores.noise,
            responsiveness_score: scores.responsiveness,
            confidence_score: scores.confidence,
            derived_state: scores.state,
        };
        self.store.append_analysis(&window).await?;

        let latest = self.store.get_latest_raw(target_id).await?;
        let payload = UpdatePayload {
            target_id: target_id.to_string(),
            channel,
            rtt_ms: latest.as_ref().and_then(|m| m.target_rtt_ms),
            state: scores.state,
            confidence: scores.confidence,
            noise: scores.noise,
            responsiveness: scores.responsiveness,
            median: baseline.as_ref().map(|b| b.median_rtt_ms),
            threshold: baseline.as_ref().map(|b| b.threshold()),
            timestamp_ms: latest.as_ref().map(|m| m.timestamp_ms).unwrap_or(now),
        };
        // nobody listening is fine
        let _ = self.updates_tx.send(ServerEvent::Update(payload));
        Ok(())
    }
}

/// Consume measurement-completed notifications from the schedulers.
///
/// Each run executes on its own task so a panic in inference can never take
/// the worker (or anything upstream of it) down.
pub fn spawn_analysis_worker(
    engine: Arc<AnalysisEngine>,
    mut rx: mpsc::UnboundedReceiver<crate::scheduler::AnalysisNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            let engine = engine.clone();
            let run = tokio::spawn(async move {
                engine
                    .run_for_target(&notice.target_id, notice.channel)
                    .await;
            });
            if run.await.is_err() {
                tracing::error!("analysis task panicked; continuing");
            }
        }
        tracing::info!("analysis worker stopped");
    })
}

/// Periodic sweep over all tracked targets.
pub fn spawn_analysis_sweep(
    engine: Arc<AnalysisEngine>,
    targets: Arc<RwLock<HashMap<String, TrackedTarget>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
        ticker.tick().await; // the immediate first tick
        loop {
            ticker.tick().await;
            let tracked: Vec<(String, Channel)> = targets
                .read()
                .await
                .values()
                .map(|t| (t.info.target_id.clone(), t.info.channel))
                .collect();
            for (target_id, channel) in tracked {
                let engine = engine.clone();
                let run = tokio::spawn(async move {
                    engine.run_for_target(&target_id, channel).await;
                });
                if run.await.is_err() {
                    tracing::error!("analysis sweep task panicked; continuing");
                }
            }
        }
    })
}
