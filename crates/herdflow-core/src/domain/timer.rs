use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::instance::{StepId, WorkflowId};

/// Value object: Timer ID
///
/// Derived from the timer key, so re-registering the same key replaces
/// the earlier entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub String);

/// What a timer enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerKind {
    /// Step `maxWaitDays` window
    StepTimeout,
    /// `WAIT_DAYS` action elapsed
    WaitElapsed,
    /// Workflow `maxDuration` deadline
    WorkflowDeadline,
}

/// Durable timer owned by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTimer {
    /// Timer ID
    pub id: TimerId,

    /// Owning workflow
    pub workflow_id: WorkflowId,

    /// Step the timer belongs to
    pub step_id: StepId,

    /// What the timer enforces
    pub kind: TimerKind,

    /// Step epoch at registration; a mismatch at firing time makes the timer stale
    pub step_epoch: u64,

    /// Due time
    pub fires_at: DateTime<Utc>,
}

impl WorkflowTimer {
    /// Create a timer keyed by workflow, step, kind and an optional discriminator
    pub fn new(
        workflow_id: &WorkflowId,
        step_id: &StepId,
        kind: TimerKind,
        discriminator: Option<&str>,
        step_epoch: u64,
        fires_at: DateTime<Utc>,
    ) -> Self {
        let mut key = format!("{}/{}/{:?}", workflow_id.0, step_id.0, kind);
        if let Some(discriminator) = discriminator {
            key.push('/');
            key.push_str(discriminator);
        }
        Self {
            id: TimerId(key),
            workflow_id: workflow_id.clone(),
            step_id: step_id.clone(),
            kind,
            step_epoch,
            fires_at,
        }
    }

    /// Whether the timer is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fires_at <= now
    }

    /// Suspend the timer, keeping its remaining duration
    pub fn suspend(&self, now: DateTime<Utc>) -> SuspendedTimer {
        let remaining = (self.fires_at - now).max(Duration::zero());
        SuspendedTimer {
            timer: self.clone(),
            remaining_ms: remaining.num_milliseconds(),
        }
    }
}

/// Timer removed from the scheduler while its workflow is paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedTimer {
    /// Timer as it was scheduled
    pub timer: WorkflowTimer,

    /// Time left when the workflow was paused
    pub remaining_ms: i64,
}

impl SuspendedTimer {
    /// Reschedule relative to `now`
    pub fn reschedule(&self, now: DateTime<Utc>) -> WorkflowTimer {
        let mut timer = self.timer.clone();
        timer.fires_at = now + Duration::milliseconds(self.remaining_ms);
        timer
    }
}

/// Days expressed as a chrono duration, with fractional days supported
pub fn days(value: f64) -> Duration {
    Duration::milliseconds((value * 86_400_000.0).round() as i64)
}
