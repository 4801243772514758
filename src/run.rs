//! Run orchestration.
//!
//! A [`Run`] owns the settings snapshot and the step list. [`Run::start`]
//! moves it onto a background thread and hands back a [`RunHandle`]; progress
//! flows over the update channel while the handle reports the outcome.
//!
//! ```text
//! for each step:
//!     stage update ─▶ name update ─▶ execute ─▶ blank line
//!                                      │
//!                                      └─ error ─▶ error update, stop
//! ```

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::command::{CommandRunner, SystemRunner};
use crate::config::Settings;
use crate::disk::{SystemTopology, TopologySource};
use crate::error::{InstallError, Result};
use crate::progress::{MsgLevel, UpdateSender};
use crate::run_state::RunTracker;
use crate::steps::{InstallPaths, StepContext, StepKind, Timings};

/// Collaborators and knobs shared by every step of a run.
#[derive(Clone)]
pub struct RunEnv {
    pub runner: Arc<dyn CommandRunner>,
    pub topology: Arc<dyn TopologySource>,
    pub paths: InstallPaths,
    pub timings: Timings,
}

impl RunEnv {
    /// Real commands, real topology, production paths and delays.
    pub fn system() -> Self {
        Self {
            runner: Arc::new(SystemRunner::new()),
            topology: Arc::new(SystemTopology),
            paths: InstallPaths::default(),
            timings: Timings::default(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { step: StepKind, error: String },
    /// The run thread died before any step started.
    Aborted { error: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A configured installation attempt.
pub struct Run {
    updates: UpdateSender,
    settings: Settings,
    steps: Vec<StepKind>,
    env: RunEnv,
    tracker: RunTracker,
}

impl Run {
    /// Run with an explicit step list.
    pub fn new(updates: UpdateSender, settings: Settings, steps: Vec<StepKind>, env: RunEnv) -> Self {
        Self {
            updates,
            settings,
            steps,
            env,
            tracker: RunTracker::new(),
        }
    }

    /// Run with the default pipeline.
    pub fn configure(updates: UpdateSender, settings: Settings, env: RunEnv) -> Self {
        Self::new(updates, settings, StepKind::default_pipeline(), env)
    }

    pub fn steps(&self) -> &[StepKind] {
        &self.steps
    }

    /// Begin executing on a background thread.
    pub fn start(mut self) -> Result<RunHandle> {
        self.tracker.start()?;
        let completion = Arc::new(Completion::default());
        let signal = Arc::clone(&completion);

        let thread = thread::Builder::new()
            .name("install-run".to_string())
            .spawn(move || {
                let outcome = self.execute(&signal);
                signal.finish(outcome);
            })
            .map_err(|e| InstallError::general(format!("failed to start run thread: {}", e)))?;

        Ok(RunHandle {
            completion,
            thread: Some(thread),
        })
    }

    fn execute(mut self, completion: &Completion) -> RunOutcome {
        self.updates
            .raw(MsgLevel::Command, "Commencing installation.\n");

        let ctx = StepContext {
            settings: &self.settings,
            updates: &self.updates,
            runner: self.env.runner.as_ref(),
            topology: self.env.topology.as_ref(),
            paths: &self.env.paths,
            timings: &self.env.timings,
        };

        for &step in &self.steps {
            if let Err(e) = self.tracker.enter_step(step) {
                return RunOutcome::Failed {
                    step,
                    error: e.to_string(),
                };
            }
            completion.enter(step);
            self.updates.stage(step.stage());
            self.updates
                .raw(MsgLevel::Command, format!("{}\n", step.name()));
            info!("Starting step {}", step.name());

            if let Err(e) = step.execute(&ctx) {
                error!("{} failed: {}", step.name(), e);
                self.updates
                    .error(format!("{} failed: {}\n", step.name(), e));
                if let Err(te) = self.tracker.fail() {
                    error!("Recording failure: {}", te);
                }
                debug!("Run history: {:?}", self.tracker.history());
                return RunOutcome::Failed {
                    step,
                    error: e.to_string(),
                };
            }
            self.updates.blank();
        }

        if let Err(e) = self.tracker.complete() {
            error!("Recording completion: {}", e);
        }
        debug!("Run history: {:?}", self.tracker.history());
        info!("Installation {}", self.tracker.phase());
        self.updates
            .raw(MsgLevel::Command, "Installation complete.\n");
        RunOutcome::Completed
    }
}

#[derive(Default)]
struct Completion {
    outcome: Mutex<Option<RunOutcome>>,
    done: Condvar,
    /// Last step the run thread entered.
    current: Mutex<Option<StepKind>>,
}

impl Completion {
    fn enter(&self, step: StepKind) {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = Some(step);
    }

    /// Outcome for a run thread that exited without reporting one.
    fn abandoned(&self) -> RunOutcome {
        let error = "run thread exited without reporting an outcome".to_string();
        let current = match self.current.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        match current {
            Some(step) => RunOutcome::Failed { step, error },
            None => RunOutcome::Aborted { error },
        }
    }

    fn finish(&self, outcome: RunOutcome) {
        let mut slot = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(outcome);
        self.done.notify_all();
    }
}

/// Handle on a started run.
pub struct RunHandle {
    completion: Arc<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl RunHandle {
    /// Block until the run completes or fails.
    pub fn wait(mut self) -> RunOutcome {
        let outcome = {
            let mut slot = match self.completion.outcome.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            loop {
                if let Some(outcome) = slot.take() {
                    break Some(outcome);
                }
                if self.thread.as_ref().is_some_and(|t| t.is_finished()) {
                    break None;
                }
                slot = match self
                    .completion
                    .done
                    .wait_timeout(slot, std::time::Duration::from_millis(200))
                {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        };

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Run thread panicked");
            }
        }

        outcome.unwrap_or_else(|| self.completion.abandoned())
    }
}
