use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// Storage format for every timestamp column in the job store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// Formats external workers are known to write besides our own.
const ACCEPTED_FORMATS: &[&str] = &[
    TIMESTAMP_FORMAT,
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a search job.
///
/// The integer codes are part of the persisted schema shared with the worker
/// pools: 0=Queued, 1=Running, 2=Done, 3=Failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    pub fn code(self) -> i64 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Done => 2,
            JobStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobStatus::Queued),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Done),
            3 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Counted as "pending" by the stats path.
    pub fn is_pending(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Counted as "processed" by the stats path.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Only Queued -> Running and Running -> Done/Failed are legal; nothing
    /// skips Running and terminal states never move again.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Done) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Queued, _) => false,
            (JobStatus::Running, _) => false,
            (JobStatus::Done, _) => false,
            (JobStatus::Failed, _) => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" | "0" => Ok(JobStatus::Queued),
            "running" | "1" => Ok(JobStatus::Running),
            "done" | "2" => Ok(JobStatus::Done),
            "failed" | "3" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown job status: {}", other)),
        }
    }
}

/// How a running job ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed,
}

impl From<Outcome> for JobStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => JobStatus::Done,
            Outcome::Failed => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub submitted: Option<NaiveDateTime>,
    pub started: Option<NaiveDateTime>,
    pub finished: Option<NaiveDateTime>,
}

impl JobRecord {
    /// Checks the record-level lifecycle invariants:
    /// `finished` is set iff the job is terminal, `started` is set once the
    /// job has left Queued, and `finished >= started`.
    pub fn is_consistent(&self) -> bool {
        let started_ok = match self.status {
            JobStatus::Queued => self.started.is_none(),
            JobStatus::Running | JobStatus::Done | JobStatus::Failed => self.started.is_some(),
        };
        let finished_ok = self.finished.is_some() == self.status.is_terminal();
        let ordered = match (self.started, self.finished) {
            (Some(started), Some(finished)) => finished >= started,
            _ => true,
        };
        started_ok && finished_ok && ordered
    }

    /// Processing time for a completed job.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Current time truncated to the store's one-second resolution.
pub fn now() -> NaiveDateTime {
    let now = chrono::Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_schema() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::Queued.code(), 0);
        assert_eq!(JobStatus::Failed.code(), 3);
        assert_eq!(JobStatus::from_code(4), None);
        assert_eq!(JobStatus::from_code(-1), None);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use JobStatus::*;
        let legal = [(Queued, Running), (Running, Done), (Running, Failed)];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_pending_and_terminal_partition() {
        for status in JobStatus::ALL {
            assert_ne!(status.is_pending(), status.is_terminal());
        }
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!("3".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let ts = parse_timestamp("2024-03-01 10:15:30").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01 10:15:30");
        assert_eq!(parse_timestamp("2024-03-01T10:15:30"), Some(ts));
        assert!(parse_timestamp("2024-03-01 10:15:30.250").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_now_has_whole_seconds() {
        let ts = now();
        assert_eq!(ts.nanosecond(), 0);
        assert_eq!(parse_timestamp(&format_timestamp(&ts)), Some(ts));
    }

    #[test]
    fn test_record_consistency() {
        let t0 = parse_timestamp("2024-03-01 10:00:00").unwrap();
        let t1 = parse_timestamp("2024-03-01 10:05:00").unwrap();
        let mut record = JobRecord {
            id: JobId(1),
            status: JobStatus::Done,
            submitted: Some(t0),
            started: Some(t0),
            finished: Some(t1),
        };
        assert!(record.is_consistent());
        assert_eq!(record.duration(), Some(chrono::Duration::minutes(5)));

        record.finished = None;
        assert!(!record.is_consistent());

        record.status = JobStatus::Running;
        assert!(record.is_consistent());

        record.status = JobStatus::Failed;
        record.started = Some(t1);
        record.finished = Some(t0);
        assert!(!record.is_consistent());
    }
}
