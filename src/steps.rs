//! Progress and status for each workflow step.
//!
//! Steps are independent: each one runs `pending -> active -> complete | error | stalled`
//! and can be started again with `begin` once it is no longer active. The table itself
//! has no terminal state.

use crate::error::StepError;
use crate::model::{StepId, StepState, StepStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTable {
    steps: [StepState; 3],
}

impl StepTable {
    pub fn get(&self, step: StepId) -> StepState {
        self.steps[step.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (StepId, StepState)> + '_ {
        StepId::ALL.into_iter().map(|id| (id, self.get(id)))
    }

    /// Step currently running, if any.
    pub fn active(&self) -> Option<StepId> {
        self.iter()
            .find(|(_, s)| s.status == StepStatus::Active)
            .map(|(id, _)| id)
    }

    fn slot(&mut self, step: StepId) -> &mut StepState {
        &mut self.steps[step.index()]
    }

    pub fn can_begin(&self, step: StepId) -> bool {
        self.get(step).status != StepStatus::Active
    }

    pub fn begin(&mut self, step: StepId, seed: u8) -> Result<(), StepError> {
        if seed > 100 {
            return Err(StepError::OutOfRange(seed));
        }
        let slot = self.slot(step);
        if slot.status == StepStatus::Active {
            return Err(StepError::InvalidTransition {
                step,
                op: "begin",
                from: slot.status,
            });
        }
        *slot = StepState {
            progress: seed,
            status: StepStatus::Active,
        };
        Ok(())
    }

    pub fn advance(&mut self, step: StepId, progress: u8) -> Result<(), StepError> {
        if progress > 100 {
            return Err(StepError::OutOfRange(progress));
        }
        let slot = self.slot(step);
        if slot.status != StepStatus::Active {
            return Err(StepError::InvalidTransition {
                step,
                op: "advance",
                from: slot.status,
            });
        }
        if progress < slot.progress {
            return Err(StepError::ProgressRegression {
                step,
                current: slot.progress,
                requested: progress,
            });
        }
        slot.progress = progress;
        Ok(())
    }

    pub fn complete(&mut self, step: StepId) -> Result<(), StepError> {
        let slot = self.settleable(step, "complete")?;
        *slot = StepState {
            progress: 100,
            status: StepStatus::Complete,
        };
        Ok(())
    }

    /// Marks the step failed; progress stays where it was.
    pub fn fail(&mut self, step: StepId) -> Result<(), StepError> {
        let slot = self.settleable(step, "fail")?;
        slot.status = StepStatus::Error;
        Ok(())
    }

    /// No response within the expected bound. Set by renderers, never by the orchestrator.
    pub fn stall(&mut self, step: StepId) -> Result<(), StepError> {
        let slot = self.slot(step);
        if slot.status != StepStatus::Active {
            return Err(StepError::InvalidTransition {
                step,
                op: "stall",
                from: slot.status,
            });
        }
        slot.status = StepStatus::Stalled;
        Ok(())
    }

    // A stalled step may still receive its late response.
    fn settleable(&mut self, step: StepId, op: &'static str) -> Result<&mut StepState, StepError> {
        let slot = self.slot(step);
        match slot.status {
            StepStatus::Active | StepStatus::Stalled => Ok(slot),
            from => Err(StepError::InvalidTransition { step, op, from }),
        }
    }

    pub fn reset_all(&mut self) {
        self.steps = Default::default();
    }

    /// Resets every step that did not end in `complete` or `error`.
    pub fn release_unsettled(&mut self) {
        for slot in &mut self.steps {
            if !slot.status.is_terminal() {
                *slot = StepState::default();
            }
        }
    }
}
