//! Batch workflow execution state machine.
//!
//! Phases:
//! - Submitted
//! - TransformRunning
//! - TransformCompleted
//! - PostProcessing
//! - Completed
//!
//! Any non-terminal phase may move to Failed. Completed and Failed are absorbing.
//! Tracks time spent in each phase.

use crate::error::{LifecycleError, LifecycleResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowPhase { Submitted, TransformRunning, TransformCompleted, PostProcessing, Completed, Failed }

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool { matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed) }

    fn successor(self) -> Option<WorkflowPhase> {
        match self {
            WorkflowPhase::Submitted => Some(WorkflowPhase::TransformRunning),
            WorkflowPhase::TransformRunning => Some(WorkflowPhase::TransformCompleted),
            WorkflowPhase::TransformCompleted => Some(WorkflowPhase::PostProcessing),
            WorkflowPhase::PostProcessing => Some(WorkflowPhase::Completed),
            WorkflowPhase::Completed | WorkflowPhase::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowPhase::Submitted => "submitted",
            WorkflowPhase::TransformRunning => "transform_running",
            WorkflowPhase::TransformCompleted => "transform_completed",
            WorkflowPhase::PostProcessing => "post_processing",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Step of the workflow that caused a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep { Transform, PostProcess, Timeout }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowFailure {
    pub step: WorkflowStep,
    pub reason: String,
    pub phase_at_failure: WorkflowPhase,
}

#[derive(Debug)]
pub struct WorkflowState {
    execution: String,
    phase: WorkflowPhase,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(WorkflowPhase, Duration)>,
    failure: Option<WorkflowFailure>,
}

impl WorkflowState {
    pub fn new(execution: impl Into<String>) -> Self {
        let now = Instant::now();
        Self { execution: execution.into(), phase: WorkflowPhase::Submitted, started_at: now, phase_started_at: now, phase_durations: Vec::new(), failure: None }
    }

    pub fn phase(&self) -> WorkflowPhase { self.phase }

    pub fn is_terminal(&self) -> bool { self.phase.is_terminal() }

    pub fn failure(&self) -> Option<&WorkflowFailure> { self.failure.as_ref() }

    pub fn durations(&self) -> &[(WorkflowPhase, Duration)] { &self.phase_durations }

    pub fn elapsed(&self) -> Duration { self.started_at.elapsed() }

    /// Move to the next phase in order. Skipping or going back is rejected.
    pub fn advance_to(&mut self, next: WorkflowPhase) -> LifecycleResult<()> {
        if self.phase.successor() != Some(next) {
            return Err(LifecycleError::invalid_transition(&self.execution, self.phase, next));
        }
        self.enter(next);
        Ok(())
    }

    pub fn fail(&mut self, step: WorkflowStep, reason: impl Into<String>) -> LifecycleResult<()> {
        if self.is_terminal() {
            return Err(LifecycleError::invalid_transition(&self.execution, self.phase, WorkflowPhase::Failed));
        }
        self.failure = Some(WorkflowFailure { step, reason: reason.into(), phase_at_failure: self.phase });
        self.enter(WorkflowPhase::Failed);
        Ok(())
    }

    fn enter(&mut self, next: WorkflowPhase) {
        let now = Instant::now();
        self.phase_durations.push((self.phase, now - self.phase_started_at));
        self.phase = next;
        self.phase_started_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_progresses_in_order() {
        let mut st = WorkflowState::new("run-1");
        for next in [WorkflowPhase::TransformRunning, WorkflowPhase::TransformCompleted, WorkflowPhase::PostProcessing, WorkflowPhase::Completed] {
            st.advance_to(next).unwrap();
        }
        assert!(st.is_terminal());
        assert_eq!(st.durations().len(), 4);
        assert!(st.failure().is_none());
    }

    #[test]
    fn skipping_post_processing_rejected() {
        let mut st = WorkflowState::new("run-1");
        st.advance_to(WorkflowPhase::TransformRunning).unwrap();
        assert!(st.advance_to(WorkflowPhase::PostProcessing).is_err());
        assert_eq!(st.phase(), WorkflowPhase::TransformRunning);
    }

    #[test]
    fn failed_is_absorbing() {
        let mut st = WorkflowState::new("run-1");
        st.advance_to(WorkflowPhase::TransformRunning).unwrap();
        st.fail(WorkflowStep::Transform, "oom").unwrap();
        assert_eq!(st.failure().unwrap().phase_at_failure, WorkflowPhase::TransformRunning);
        assert!(st.fail(WorkflowStep::Timeout, "late").is_err());
        assert!(st.advance_to(WorkflowPhase::TransformCompleted).is_err());
        assert_eq!(st.phase(), WorkflowPhase::Failed);
    }
}
