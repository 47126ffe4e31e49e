//! Step resolution over a template's step graph

use serde::{Deserialize, Serialize};

use super::instance::{StepId, WorkflowStatus};
use super::template::WorkflowStep;

/// Rule that produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolvedPath {
    /// Workflow entered its starting step
    Start,
    /// Human-chosen next step
    ManualOverride,
    /// `successNextStep`
    Success,
    /// `failureNextStep`
    Failure,
    /// `defaultNextStep`
    Default,
    /// No pointer after a successful exit
    Completed,
    /// No pointer after a failed exit
    Failed,
    /// Instance stayed where it was (commands, escalations)
    Unchanged,
}

/// Where the workflow goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Enter another step (possibly the same one)
    Next {
        /// Step to enter
        step_id: StepId,
        /// Rule used
        path: ResolvedPath,
    },
    /// End the workflow
    Terminal {
        /// COMPLETED or FAILED
        status: WorkflowStatus,
        /// Rule used
        path: ResolvedPath,
    },
}

impl Resolution {
    /// Rule used
    pub fn path(&self) -> ResolvedPath {
        match self {
            Self::Next { path, .. } | Self::Terminal { path, .. } => *path,
        }
    }

    /// Next step, if any
    pub fn next_step(&self) -> Option<&StepId> {
        match self {
            Self::Next { step_id, .. } => Some(step_id),
            Self::Terminal { .. } => None,
        }
    }
}

/// Picks the next step from an exit evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct StepResolver;

impl StepResolver {
    /// Resolve the successor of `step`
    ///
    /// A manual override wins unconditionally. Otherwise the outcome's own
    /// pointer is preferred, then the default pointer, then termination.
    pub fn resolve_next(
        &self,
        step: &WorkflowStep,
        exit_result: bool,
        manual_override: Option<&StepId>,
    ) -> Resolution {
        if let Some(target) = manual_override {
            return Resolution::Next {
                step_id: target.clone(),
                path: ResolvedPath::ManualOverride,
            };
        }

        let (own, own_path, end) = if exit_result {
            (
                step.success_next(),
                ResolvedPath::Success,
                (WorkflowStatus::Completed, ResolvedPath::Completed),
            )
        } else {
            (
                step.failure_next(),
                ResolvedPath::Failure,
                (WorkflowStatus::Failed, ResolvedPath::Failed),
            )
        };

        match (own, step.default_next()) {
            (Some(next), _) => Resolution::Next {
                step_id: next.clone(),
                path: own_path,
            },
            (None, Some(next)) => Resolution::Next {
                step_id: next.clone(),
                path: ResolvedPath::Default,
            },
            (None, None) => Resolution::Terminal {
                status: end.0,
                path: end.1,
            },
        }
    }

    /// Successor of a step whose entry conditions did not hold
    ///
    /// Follows the default pointer, then the success pointer; `None` ends
    /// the workflow as completed.
    pub fn resolve_skip<'a>(&self, step: &'a WorkflowStep) -> Option<&'a StepId> {
        step.default_next().or_else(|| step.success_next())
    }
}
