//! Run state machine.
//!
//! ```text
//! Created ──start──▶ Running ──complete──▶ Completed
//!                       │
//!                       └──────fail──────▶ Failed
//! ```
//!
//! Terminal states are final. Steps can only be entered while running.

use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::steps::StepKind;

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunPhase {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Rejected transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("run is already {from}")]
    FromTerminalState { from: RunPhase },

    #[error("run already started")]
    AlreadyRunning,

    #[error("run is {phase}, not running")]
    NotRunning { phase: RunPhase },
}

impl From<RunTransitionError> for crate::error::InstallError {
    fn from(err: RunTransitionError) -> Self {
        crate::error::InstallError::RunTransition(err.to_string())
    }
}

/// Validated run lifecycle with a timestamped history.
#[derive(Debug, Clone)]
pub struct RunTracker {
    phase: RunPhase,
    current_step: Option<StepKind>,
    /// (phase, unix seconds)
    history: Vec<(RunPhase, u64)>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Created,
            current_step: None,
            history: vec![(RunPhase::Created, now_secs())],
        }
    }

    #[inline]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn history(&self) -> &[(RunPhase, u64)] {
        &self.history
    }

    fn check_not_terminal(&self) -> Result<(), RunTransitionError> {
        if self.phase.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.phase });
        }
        Ok(())
    }

    fn check_running(&self) -> Result<(), RunTransitionError> {
        self.check_not_terminal()?;
        if self.phase != RunPhase::Running {
            return Err(RunTransitionError::NotRunning { phase: self.phase });
        }
        Ok(())
    }

    fn record(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.history.push((phase, now_secs()));
    }

    pub fn start(&mut self) -> Result<(), RunTransitionError> {
        self.check_not_terminal()?;
        if self.phase == RunPhase::Running {
            return Err(RunTransitionError::AlreadyRunning);
        }
        self.record(RunPhase::Running);
        Ok(())
    }

    pub fn enter_step(&mut self, step: StepKind) -> Result<(), RunTransitionError> {
        self.check_running()?;
        debug!("Entering step {}", step);
        self.current_step = Some(step);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), RunTransitionError> {
        self.check_running()?;
        self.current_step = None;
        self.record(RunPhase::Completed);
        Ok(())
    }

    /// Fail the run at the current step.
    pub fn fail(&mut self) -> Result<(), RunTransitionError> {
        self.check_running()?;
        if let Some(step) = self.current_step.take() {
            debug!("Run failed during {}", step);
        }
        self.record(RunPhase::Failed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut t = RunTracker::new();
        assert_eq!(t.phase(), RunPhase::Created);
        t.start().unwrap();
        for step in StepKind::default_pipeline() {
            t.enter_step(step).unwrap();
        }
        t.complete().unwrap();
        assert_eq!(t.phase(), RunPhase::Completed);
        let phases: Vec<RunPhase> = t.history().iter().map(|(p, _)| *p).collect();
        assert_eq!(
            phases,
            [RunPhase::Created, RunPhase::Running, RunPhase::Completed]
        );
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut t = RunTracker::new();
        t.start().unwrap();
        t.enter_step(StepKind::Partition).unwrap();
        t.enter_step(StepKind::Configure).unwrap();
        t.fail().unwrap();
        assert_eq!(t.phase(), RunPhase::Failed);
        assert!(t.enter_step(StepKind::Install).is_err());
        let phases: Vec<RunPhase> = t.history().iter().map(|(p, _)| *p).collect();
        assert_eq!(phases.last(), Some(&RunPhase::Failed));
    }

    #[test]
    fn test_cannot_complete_before_start() {
        let mut t = RunTracker::new();
        assert_eq!(
            t.complete(),
            Err(RunTransitionError::NotRunning {
                phase: RunPhase::Created
            })
        );
        assert!(t.enter_step(StepKind::Partition).is_err());
    }

    #[test]
    fn test_cannot_restart() {
        let mut t = RunTracker::new();
        t.start().unwrap();
        assert_eq!(t.start(), Err(RunTransitionError::AlreadyRunning));
        t.complete().unwrap();
        assert_eq!(
            t.start(),
            Err(RunTransitionError::FromTerminalState {
                from: RunPhase::Completed
            })
        );
        assert!(t.fail().is_err());
    }

    #[test]
    fn test_error_conversion() {
        let err: crate::error::InstallError = RunTransitionError::AlreadyRunning.into();
        assert!(matches!(err, crate::error::InstallError::RunTransition(_)));
        assert_eq!(err.to_string(), "Run transition error: run already started");
    }
}
