//! In-memory recording store

use super::{RecordingRow, RecordingStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Summary of one stored recording
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub recording_id: u64,
    pub rows: usize,
    /// When the first row arrived
    pub created_at: DateTime<Utc>,
    pub last_timestamp: Option<f64>,
}

#[derive(Debug)]
struct StoredRecording {
    rows: Vec<RecordingRow>,
    created_at: DateTime<Utc>,
}

/// Thread-safe store keeping every row in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    recordings: Mutex<HashMap<u64, StoredRecording>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows stored for a recording
    pub fn row_count(&self, recording_id: u64) -> usize {
        self.recordings
            .lock()
            .ok()
            .and_then(|r| r.get(&recording_id).map(|rec| rec.rows.len()))
            .unwrap_or(0)
    }

    /// All recordings, ordered by id
    pub fn recordings(&self) -> Vec<RecordingSummary> {
        let Ok(recordings) = self.recordings.lock() else {
            return Vec::new();
        };
        let mut summaries: Vec<RecordingSummary> = recordings
            .iter()
            .map(|(&id, rec)| RecordingSummary {
                recording_id: id,
                rows: rec.rows.len(),
                created_at: rec.created_at,
                last_timestamp: rec.rows.last().map(|r| r.time_stamp),
            })
            .collect();
        summaries.sort_by_key(|s| s.recording_id);
        summaries
    }

    fn with_rows<T>(
        &self,
        recording_id: u64,
        f: impl FnOnce(&[RecordingRow]) -> T,
    ) -> Result<T, StoreError> {
        let recordings = self
            .recordings
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(match recordings.get(&recording_id) {
            Some(rec) => f(&rec.rows),
            None => f(&[]),
        })
    }
}

impl RecordingStore for MemoryStore {
    fn insert_batch(&self, rows: &[RecordingRow]) -> Result<(), StoreError> {
        let mut recordings = self
            .recordings
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        for row in rows {
            recordings
                .entry(row.recording_id)
                .or_insert_with(|| StoredRecording {
                    rows: Vec::new(),
                    created_at: Utc::now(),
                })
                .rows
                .push(row.clone());
        }
        Ok(())
    }

    fn query_interval(
        &self,
        recording_id: u64,
        start: f64,
        end: f64,
    ) -> Result<Vec<RecordingRow>, StoreError> {
        self.with_rows(recording_id, |rows| {
            rows.iter()
                .filter(|r| r.time_stamp >= start && r.time_stamp <= end)
                .cloned()
                .collect()
        })
    }

    fn query_recent_events(&self, recording_id: u64) -> Result<Vec<RecordingRow>, StoreError> {
        self.with_rows(recording_id, |rows| {
            rows.iter().filter(|r| r.event).cloned().collect()
        })
    }

    fn query_from(
        &self,
        recording_id: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RecordingRow>, StoreError> {
        self.with_rows(recording_id, |rows| {
            rows.iter().skip(offset).take(limit).cloned().collect()
        })
    }

    fn last_timestamp(&self, recording_id: u64) -> Result<Option<f64>, StoreError> {
        self.with_rows(recording_id, |rows| rows.last().map(|r| r.time_stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::calculation::HaemoValues;

    fn row(id: u64, ts: f64, event: bool) -> RecordingRow {
        RecordingRow {
            recording_id: id,
            time_stamp: ts,
            values: HaemoValues::default(),
            raw: vec![],
            event,
        }
    }

    #[test]
    fn test_interval_is_inclusive() {
        let store = MemoryStore::new();
        let rows: Vec<_> = (0..10).map(|i| row(1, i as f64 * 10.0, false)).collect();
        store.insert_batch(&rows).unwrap();

        let found = store.query_interval(1, 20.0, 50.0).unwrap();
        let stamps: Vec<f64> = found.iter().map(|r| r.time_stamp).collect();
        assert_eq!(stamps, vec![20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_events_and_paging() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[row(2, 0.0, false), row(2, 10.0, true), row(2, 20.0, true)])
            .unwrap();
        store.insert_batch(&[row(3, 0.0, true)]).unwrap();

        assert_eq!(store.query_recent_events(2).unwrap().len(), 2);
        assert_eq!(store.query_from(2, 1, 5).unwrap().len(), 2);
        assert_eq!(store.query_from(2, 9, 5).unwrap().len(), 0);
        assert_eq!(store.last_timestamp(2).unwrap(), Some(20.0));
        assert_eq!(store.last_timestamp(7).unwrap(), None);
    }

    #[test]
    fn test_unknown_recording_reads_as_empty() {
        let store = MemoryStore::new();
        assert!(store.query_from(9, 0, 25).unwrap().is_empty());
        assert!(store.query_interval(9, 0.0, 100.0).unwrap().is_empty());
        assert!(store.query_recent_events(9).unwrap().is_empty());
        assert_eq!(store.last_timestamp(9).unwrap(), None);
    }

    #[test]
    fn test_recordings_summary() {
        let store = MemoryStore::new();
        store.insert_batch(&[row(5, 0.0, false), row(4, 3.0, false)]).unwrap();
        let summaries = store.recordings();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].recording_id, 4);
        assert_eq!(summaries[0].last_timestamp, Some(3.0));
        assert_eq!(store.row_count(5), 1);
    }
}
