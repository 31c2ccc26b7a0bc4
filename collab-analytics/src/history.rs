//! Engagement history persistence
//!
//! Optional: the coordinator hands every engagement report to a `HistorySink`
//! as one record per participant. Storage is owned by the collaborator that
//! implements the trait.

use crate::scoring::EngagementReport;
use crate::types::{ParticipantId, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// One persisted engagement data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementHistoryRecord {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub window_end: DateTime<Utc>,
    pub attention_score: f64,
    pub speaking_seconds: f64,
}

impl EngagementHistoryRecord {
    /// Flatten a report into one record per ranked participant
    #[must_use]
    pub fn from_report(report: &EngagementReport) -> Vec<Self> {
        report
            .participants
            .iter()
            .map(|p| Self {
                session_id: report.session_id.clone(),
                participant_id: p.participant_id.clone(),
                window_end: report.window_end,
                attention_score: p.attention_score,
                speaking_seconds: p.speaking_seconds,
            })
            .collect()
    }
}

/// Destination for engagement history
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, records: Vec<EngagementHistoryRecord>) -> anyhow::Result<()>;
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<EngagementHistoryRecord>>,
}

impl InMemoryHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<EngagementHistoryRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn records_for(&self, session_id: &SessionId) -> Vec<EngagementHistoryRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| &r.session_id == session_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn record(&self, records: Vec<EngagementHistoryRecord>) -> anyhow::Result<()> {
        self.records.lock().extend(records);
        Ok(())
    }
}

/// Appends records as JSON lines to a writer
pub struct JsonLinesHistory<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesHistory<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W: Write + Send> HistorySink for JsonLinesHistory<W> {
    async fn record(&self, records: Vec<EngagementHistoryRecord>) -> anyhow::Result<()> {
        let mut writer = self.writer.lock();
        for record in &records {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}
