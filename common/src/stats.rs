//! Live queue statistics for the portal front-end.

use crate::store::{JobStore, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Lower bound on which completed jobs count toward the average.
///
/// A job is inside the window when its `started` timestamp is strictly after
/// `since`. `all()` applies no bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingWindow {
    since: Option<NaiveDateTime>,
}

impl ReportingWindow {
    pub fn all() -> Self {
        Self { since: None }
    }

    pub fn since(ts: NaiveDateTime) -> Self {
        Self { since: Some(ts) }
    }

    /// Trailing window ending now.
    pub fn last(span: chrono::Duration) -> Self {
        Self::since(crate::job::now() - span)
    }

    pub fn last_days(days: Option<u32>) -> Self {
        match days {
            Some(days) => Self::last(chrono::Duration::days(i64::from(days))),
            None => Self::all(),
        }
    }

    pub fn since_bound(&self) -> Option<NaiveDateTime> {
        self.since
    }
}

/// Mean processing time, or a sentinel when nothing has completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AverageDuration {
    NotApplicable,
    Minutes(u64),
}

impl AverageDuration {
    /// Mean of `finished - started`, rounded to whole minutes (ties to even).
    pub fn from_spans(spans: &[(NaiveDateTime, NaiveDateTime)]) -> Self {
        if spans.is_empty() {
            return AverageDuration::NotApplicable;
        }
        let total_secs: i64 = spans
            .iter()
            .map(|(started, finished)| (*finished - *started).num_seconds().max(0))
            .sum();
        let mean_minutes = total_secs as f64 / spans.len() as f64 / 60.0;
        AverageDuration::Minutes(mean_minutes.round_ties_even() as u64)
    }

    pub fn minutes(&self) -> Option<u64> {
        match self {
            AverageDuration::NotApplicable => None,
            AverageDuration::Minutes(m) => Some(*m),
        }
    }
}

impl std::fmt::Display for AverageDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AverageDuration::NotApplicable => f.write_str("n/a"),
            AverageDuration::Minutes(m) => write!(
                f,
                "{} minute{}",
                group_thousands(*m),
                if *m > 1 { "s" } else { "" }
            ),
        }
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Everything the front-end renders about the queue on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pending: u64,
    pub processed: u64,
    pub average_duration: AverageDuration,
    pub average_duration_display: String,
}

/// Read-only aggregate queries over the job store.
pub struct StatsAggregator<'a> {
    store: &'a JobStore,
    window: ReportingWindow,
}

impl<'a> StatsAggregator<'a> {
    pub fn new(store: &'a JobStore, window: ReportingWindow) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> ReportingWindow {
        self.window
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.store.pending_count()
    }

    pub fn processed_count(&self) -> Result<u64> {
        self.store.processed_count()
    }

    pub fn average_duration_minutes(&self) -> Result<AverageDuration> {
        let spans = self.store.completed_spans(&self.window)?;
        Ok(AverageDuration::from_spans(&spans))
    }

    pub fn snapshot(&self) -> Result<StatsSnapshot> {
        let average_duration = self.average_duration_minutes()?;
        Ok(StatsSnapshot {
            pending: self.pending_count()?,
            processed: self.processed_count()?,
            average_duration_display: average_duration.to_string(),
            average_duration,
        })
    }
}
