use crate::types::JobPolicy;

/// What happens to a job once a run has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back to pending, reservation released.
    Keep,
    /// Deleted from the job list.
    Remove,
}

impl JobPolicy {
    /// Stored discriminator, also used by the due-filter in SQL.
    pub fn kind(&self) -> &'static str {
        match self {
            JobPolicy::Regular => "regular",
            JobPolicy::Queued => "queued",
            JobPolicy::Timed { .. } => "timed",
        }
    }

    pub fn interval_secs(&self) -> u64 {
        match self {
            JobPolicy::Timed { interval_secs } => *interval_secs,
            _ => 0,
        }
    }

    /// Rebuild a policy from its stored columns.
    pub fn from_parts(kind: &str, interval_secs: i64) -> Option<Self> {
        match kind {
            "regular" => Some(JobPolicy::Regular),
            "queued" => Some(JobPolicy::Queued),
            "timed" => Some(JobPolicy::Timed {
                interval_secs: interval_secs.max(0) as u64,
            }),
            _ => None,
        }
    }

    /// Whether a job with this policy may run at `now`.
    ///
    /// Timed jobs compare wall-clock seconds; if the clock went backwards and
    /// `now` is before `last_run`, the job is simply not due yet.
    pub fn is_due(&self, last_run: i64, now: i64) -> bool {
        match self {
            JobPolicy::Regular | JobPolicy::Queued => true,
            JobPolicy::Timed { interval_secs } => {
                let elapsed = now.saturating_sub(last_run);
                elapsed >= 0 && elapsed as u64 >= *interval_secs
            }
        }
    }

    /// Disposition after a completed run, successful or not.
    pub fn after_run(&self) -> Disposition {
        match self {
            JobPolicy::Queued => Disposition::Remove,
            JobPolicy::Regular | JobPolicy::Timed { .. } => Disposition::Keep,
        }
    }
}
