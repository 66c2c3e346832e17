//! Measurement store service
//!
//! Append-only persistence for raw measurements and local network metrics,
//! plus the derived baselines and analysis windows. All writes go through the
//! single mutex-serialized connection; transient lock contention is retried
//! with jittered backoff before escalating to a fatal error.

use crate::clock::jittered_delay_ms;
use crate::database::DbConnection;
use crate::errors::StoreError;
use common::{AnalysisWindow, Baseline, Channel, LocalNetworkSample, Measurement, ProbeMethod, TrackerState};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::time::Duration;

/// Attempts per write before lock contention is treated as fatal.
const MAX_WRITE_ATTEMPTS: u32 = 5;

pub struct MeasurementStore {
    db: DbConnection,
}

impl MeasurementStore {
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    /// Run a write against the connection, retrying transient contention.
    async fn write<F>(&self, op: &'static str, f: F) -> Result<(), StoreError>
    where
        F: Fn(&Connection) -> rusqlite::Result<usize>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let conn = self.db.lock().await;
                f(&conn)
            };
            match result {
                Ok(_) => return Ok(()),
                Err(e) => match StoreError::from(e) {
                    StoreError::Transient(msg) => {
                        attempt += 1;
                        if attempt >= MAX_WRITE_ATTEMPTS {
                            return Err(StoreError::Fatal(format!(
                                "{op} still contended after {MAX_WRITE_ATTEMPTS} attempts: {msg}"
                            )));
                        }
                        let backoff =
                            jittered_delay_ms(50 * attempt as u64, 150 * attempt as u64);
                        tracing::warn!(
                            "{} contended (attempt {}), retrying in {}ms",
                            op,
                            attempt,
                            backoff
                        );
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                    fatal => return Err(fatal),
                },
            }
        }
    }

    /// Append one completed probe cycle. Durable before this returns.
    pub async fn append_raw(&self, m: &Measurement) -> Result<(), StoreError> {
        tracing::debug!(
            "append_raw target={} channel={} rtt={:?} timeout={}",
            m.target_id,
            m.channel,
            m.target_rtt_ms,
            m.timeout
        );
        let m = m.clone();
        self.write("append_raw", move |conn| {
            conn.execute(
                "INSERT INTO raw_measurements (
                    timestamp_ms, channel, target_id, target_rtt_ms, timeout,
                    local_network_rtt_ms, probe_method
                ) VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    m.timestamp_ms,
                    m.channel.as_str(),
                    m.target_id,
                    m.target_rtt_ms,
                    m.timeout,
                    m.local_network_rtt_ms,
                    m.probe_method.as_str(),
                ],
            )
        })
        .await
    }

    /// Append one control probe sample.
    pub async fn append_local(&self, s: &LocalNetworkSample) -> Result<(), StoreError> {
        let s = s.clone();
        self.write("append_local", move |conn| {
            conn.execute(
                "INSERT INTO local_network_metrics (
                    timestamp_ms, rtt_ms, timeout, variance_ms, packet_loss_rate,
                    reference_target
                ) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    s.timestamp_ms,
                    s.rtt_ms,
                    s.timeout,
                    s.variance_ms,
                    s.packet_loss_rate,
                    s.reference_target,
                ],
            )
        })
        .await
    }

    /// Insert or replace the baseline row for a target.
    pub async fn upsert_baseline(&self, b: &Baseline) -> Result<(), StoreError> {
        let b = b.clone();
        self.write("upsert_baseline", move |conn| {
            conn.execute(
                "INSERT INTO baselines (
                    target_id, channel, min_rtt_ms, median_rtt_ms, iqr_ms,
                    updated_at_ms, sample_count
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(target_id) DO UPDATE SET
                    channel = excluded.channel,
                    min_rtt_ms = excluded.min_rtt_ms,
                    median_rtt_ms = excluded.median_rtt_ms,
                    iqr_ms = excluded.iqr_ms,
                    updated_at_ms = excluded.updated_at_ms,
                    sample_count = excluded.sample_count",
                params![
                    b.target_id,
                    b.channel.as_str(),
                    b.min_rtt_ms,
                    b.median_rtt_ms,
                    b.iqr_ms,
                    b.updated_at_ms,
                    b.sample_count,
                ],
            )
        })
        .await
    }

    /// Append one analysis window.
    pub async fn append_analysis(&self, w: &AnalysisWindow) -> Result<(), StoreError> {
        let w = w.clone();
        self.write("append_analysis", move |conn| {
            conn.execute(
                "INSERT INTO analysis_windows (
                    start_ms, end_ms, target_id, channel, sample_count,
                    noise_score, responsiveness_score, confidence_score, derived_state
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    w.start_ms,
                    w.end_ms,
                    w.target_id,
                    w.channel.as_str(),
                    w.sample_count,
                    w.noise_score,
                    w.responsiveness_score,
                    w.confidence_score,
                    w.derived_state.as_str(),
                ],
            )
        })
        .await
    }

    /// Most recent successful RTTs for a target, newest first.
    pub async fn get_recent_success_rtts(
        &self,
        target_id: &str,
        channel: Channel,
        limit: u32,
    ) -> Result<Vec<i64>, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT target_rtt_ms FROM raw_measurements
                 WHERE target_id = ? AND channel = ? AND timeout = 0
                   AND target_rtt_ms IS NOT NULL
                 ORDER BY timestamp_ms DESC LIMIT ?",
            )
            .map_err(StoreError::from)?;
        let rtts = stmt
            .query_map(params![target_id, channel.as_str(), limit], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rtts)
    }

    /// All raw rows for a target in `[start_ms, end_ms]`, chronological.
    pub async fn get_raw_in_window(
        &self,
        target_id: &str,
        channel: Channel,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, channel, target_id, target_rtt_ms, timeout,
                        local_network_rtt_ms, probe_method
                 FROM raw_measurements
                 WHERE target_id = ? AND channel = ? AND timestamp_ms BETWEEN ? AND ?
                 ORDER BY timestamp_ms ASC",
            )
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(
                params![target_id, channel.as_str(), start_ms, end_ms],
                measurement_from_row,
            )
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    /// Newest raw row for a target across channels, if any.
    pub async fn get_latest_raw(&self, target_id: &str) -> Result<Option<Measurement>, StoreError> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT timestamp_ms, channel, target_id, target_rtt_ms, timeout,
                    local_network_rtt_ms, probe_method
             FROM raw_measurements
             WHERE target_id = ?
             ORDER BY timestamp_ms DESC LIMIT 1",
            params![target_id],
            measurement_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Newest analysis row for a target by window end.
    pub async fn get_latest_analysis(
        &self,
        target_id: &str,
    ) -> Result<Option<AnalysisWindow>, StoreError> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT start_ms, end_ms, target_id, channel, sample_count,
                    noise_score, responsiveness_score, confidence_score, derived_state
             FROM analysis_windows
             WHERE target_id = ?
             ORDER BY end_ms DESC, id DESC LIMIT 1",
            params![target_id],
            analysis_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub async fn get_baseline(&self, target_id: &str) -> Result<Option<Baseline>, StoreError> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT target_id, channel, min_rtt_ms, median_rtt_ms, iqr_ms,
                    updated_at_ms, sample_count
             FROM baselines WHERE target_id = ?",
            params![target_id],
            baseline_from_row,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Distinct local civil dates with raw data for a target, newest first.
    pub async fn get_available_days(&self, target_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT date(timestamp_ms / 1000, 'unixepoch', 'localtime') AS day
                 FROM raw_measurements
                 WHERE target_id = ?
                 ORDER BY day DESC",
            )
            .map_err(StoreError::from)?;
        let days = stmt
            .query_map(params![target_id], |row| row.get::<_, String>(0))
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(days)
    }

    /// Chronological raw rows falling on one local civil date.
    pub async fn get_raw_for_day(
        &self,
        target_id: &str,
        local_date: &str,
    ) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms, channel, target_id, target_rtt_ms, timeout,
                        local_network_rtt_ms, probe_method
                 FROM raw_measurements
                 WHERE target_id = ?
                   AND date(timestamp_ms / 1000, 'unixepoch', 'localtime') = ?
                 ORDER BY timestamp_ms ASC",
            )
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![target_id, local_date], measurement_from_row)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    /// Distinct (target, channel) pairs present in raw data. Lets clients
    /// re-add previously tracked targets after a restart.
    pub async fn tracked_channels(&self) -> Result<Vec<(String, Channel)>, StoreError> {
        let conn = self.db.lock().await;
        let mut stmt = conn
            .prepare("SELECT DISTINCT target_id, channel FROM raw_measurements")
            .map_err(StoreError::from)?;
        let pairs = stmt
            .query_map([], |row| {
                let target_id: String = row.get(0)?;
                let channel = parse_channel(row, 1)?;
                Ok((target_id, channel))
            })
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(pairs)
    }
}

fn parse_channel(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Channel> {
    let s: String = row.get(idx)?;
    Channel::from_str_loose(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown channel '{s}'").into(),
        )
    })
}

fn parse_probe_method(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<ProbeMethod> {
    let s: String = row.get(idx)?;
    ProbeMethod::from_str_loose(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown probe method '{s}'").into(),
        )
    })
}

fn measurement_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Measurement> {
    Ok(Measurement {
        timestamp_ms: row.get(0)?,
        channel: parse_channel(row, 1)?,
        target_id: row.get(2)?,
        target_rtt_ms: row.get(3)?,
        timeout: row.get(4)?,
        local_network_rtt_ms: row.get(5)?,
        probe_method: parse_probe_method(row, 6)?,
    })
}

fn baseline_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Baseline> {
    Ok(Baseline {
        target_id: row.get(0)?,
        channel: parse_channel(row, 1)?,
        min_rtt_ms: row.get(2)?,
        median_rtt_ms: row.get(3)?,
        iqr_ms: row.get(4)?,
        updated_at_ms: row.get(5)?,
        sample_count: row.get(6)?,
    })
}

fn analysis_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisWindow> {
    let state: String = row.get(8)?;
    Ok(AnalysisWindow {
        start_ms: row.get(0)?,
        end_ms: row.get(1)?,
        target_id: row.get(2)?,
        channel: parse_channel(row, 3)?,
        sample_count: row.get(4)?,
        noise_score: row.get(5)?,
        responsiveness_score: row.get(6)?,
        confidence_score: row.get(7)?,
        derived_state: TrackerState::from_str_loose(&state),
    })
}
