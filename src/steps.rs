//! Executable step kernels.
//!
//! Every step is a [`StepKernel`]: an immutable, planned description of the
//! work plus an explicit per-run state object created by [`StepKernel::init`].
//! The same kernel code runs under both strategies: the materialized strategy
//! pushes the whole input as one chunk, the streaming strategy pushes many.
//!
//! | step       | per chunk                          | at end of input              |
//! |------------|------------------------------------|------------------------------|
//! | `select`   | projects                           | nothing                      |
//! | `validate` | checks, splits off quarantine rows | reports violation counts     |
//! | `features` | applies fitted state, or buffers   | fits and emits buffered rows |
//! | `group_by` | updates the group accumulators     | emits one row per group      |
//!
//! The set of steps is closed: [`Kernel`] and [`StepState`] dispatch over the
//! four kinds.

pub mod features;
pub mod group_by;
pub mod select;
pub mod validate;

pub use features::{FeatureFitter, FeaturesKernel, FeaturesState};
pub use group_by::{GroupByKernel, GroupByState};
pub use select::SelectKernel;
pub use validate::{CheckViolations, ValidateKernel, ValidateState, ValidationSummary};

use crate::error::{PrepError, Result};
use crate::state::FeatureState;
use polars::prelude::DataFrame;
use std::path::PathBuf;

/// What a step hands on after consuming a chunk or the end of input.
#[derive(Debug, Default)]
pub struct Emit {
    /// Rows for the next step.
    pub output: Option<DataFrame>,
    /// Rows diverted to the step's quarantine output.
    pub quarantine: Option<DataFrame>,
}

impl Emit {
    pub fn output(df: DataFrame) -> Self {
        Self {
            output: Some(df),
            quarantine: None,
        }
    }
}

/// Why a pass over the input is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Produces the run's outputs.
    Output,
    /// Feeds a feature fit only; side outputs and warnings are suppressed.
    FitOnly,
}

/// A step's execution capability.
pub trait StepKernel {
    type State;

    /// Fresh accumulator for one pass over the input.
    fn init(&self, mode: PassMode) -> Self::State;

    /// Consume one chunk.
    ///
    /// # Errors
    ///
    /// Step-specific: `Validation` for strict checks, `Schema` for columns
    /// that only turn out to be missing at run time, `DataProcessing` otherwise.
    fn push(&self, state: &mut Self::State, chunk: DataFrame) -> Result<Emit>;

    /// Signal end of input.
    ///
    /// # Errors
    ///
    /// Same as [`StepKernel::push`].
    fn finish(&self, state: &mut Self::State) -> Result<Emit>;
}

/// One of the four step kernels.
#[derive(Debug, Clone)]
pub enum Kernel {
    Select(SelectKernel),
    Validate(ValidateKernel),
    Features(FeaturesKernel),
    GroupBy(GroupByKernel),
}

/// Per-pass state matching a [`Kernel`].
#[derive(Debug)]
pub enum StepState {
    Select,
    Validate(ValidateState),
    Features(FeaturesState),
    GroupBy(GroupByState),
}

impl StepState {
    pub fn validation_summary(&self) -> Option<ValidationSummary> {
        match self {
            Self::Validate(state) => Some(state.summary()),
            Self::Select | Self::Features(_) | Self::GroupBy(_) => None,
        }
    }

    /// State fitted during this pass, if the step performed a fit.
    pub fn take_fitted(&mut self) -> Option<FeatureState> {
        match self {
            Self::Features(state) => state.take_fitted(),
            Self::Select | Self::Validate(_) | Self::GroupBy(_) => None,
        }
    }
}

/// A kernel at its position in the plan.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// 1-based position in the declared step list.
    pub position: usize,
    pub kernel: Kernel,
}

impl PlannedStep {
    pub fn kind(&self) -> &'static str {
        match &self.kernel {
            Kernel::Select(_) => "select",
            Kernel::Validate(_) => "validate",
            Kernel::Features(_) => "features",
            Kernel::GroupBy(_) => "group_by",
        }
    }

    pub fn label(&self) -> String {
        step_label(self.position, self.kind())
    }

    pub fn init(&self, mode: PassMode) -> StepState {
        match &self.kernel {
            Kernel::Select(k) => {
                k.init(mode);
                StepState::Select
            }
            Kernel::Validate(k) => StepState::Validate(k.init(mode)),
            Kernel::Features(k) => StepState::Features(k.init(mode)),
            Kernel::GroupBy(k) => StepState::GroupBy(k.init(mode)),
        }
    }

    /// # Errors
    ///
    /// Whatever the kernel raises, or `DataProcessing` if `state` belongs to another kind.
    pub fn push(&self, state: &mut StepState, chunk: DataFrame) -> Result<Emit> {
        match (&self.kernel, state) {
            (Kernel::Select(k), StepState::Select) => k.push(&mut (), chunk),
            (Kernel::Validate(k), StepState::Validate(s)) => k.push(s, chunk),
            (Kernel::Features(k), StepState::Features(s)) => k.push(s, chunk),
            (Kernel::GroupBy(k), StepState::GroupBy(s)) => k.push(s, chunk),
            _ => Err(self.state_mismatch()),
        }
    }

    /// # Errors
    ///
    /// Whatever the kernel raises, or `DataProcessing` if `state` belongs to another kind.
    pub fn finish(&self, state: &mut StepState) -> Result<Emit> {
        match (&self.kernel, state) {
            (Kernel::Select(k), StepState::Select) => k.finish(&mut ()),
            (Kernel::Validate(k), StepState::Validate(s)) => k.finish(s),
            (Kernel::Features(k), StepState::Features(s)) => k.finish(s),
            (Kernel::GroupBy(k), StepState::GroupBy(s)) => k.finish(s),
            _ => Err(self.state_mismatch()),
        }
    }

    /// Quarantine target of a validate step.
    pub fn quarantine_target(&self) -> Option<&crate::io::FileRef> {
        match &self.kernel {
            Kernel::Validate(k) => k.quarantine_target(),
            Kernel::Select(_) | Kernel::Features(_) | Kernel::GroupBy(_) => None,
        }
    }

    /// Features kernel that still has to fit its parameters.
    pub fn pending_fit(&self) -> Option<&FeaturesKernel> {
        match &self.kernel {
            Kernel::Features(k) if k.needs_fit() => Some(k),
            _ => None,
        }
    }

    /// Where fitted state of this step is saved, if anywhere.
    pub fn persist_target(&self) -> Option<&PathBuf> {
        match &self.kernel {
            Kernel::Features(k) => k.persist_to(),
            Kernel::Select(_) | Kernel::Validate(_) | Kernel::GroupBy(_) => None,
        }
    }

    fn state_mismatch(&self) -> PrepError {
        PrepError::DataProcessing(format!(
            "{}: state does not belong to this step",
            self.label()
        ))
    }
}

pub(crate) fn step_label(position: usize, kind: &str) -> String {
    format!("step {position} ({kind})")
}

/// Running count, mean and sum of squared deviations (Welford).
///
/// Values are folded in row order, so results do not depend on chunking.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Moments {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Moments {
    pub(crate) fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance (`ddof = 1`).
    pub(crate) fn variance(&self) -> Option<f64> {
        (self.count > 1).then(|| self.m2 / (self.count - 1) as f64)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moments_match_two_pass_statistics() {
        let mut moments = Moments::default();
        for x in [8.0, 10.0, 12.0] {
            moments.push(x);
        }
        assert_eq!(moments.count(), 3);
        assert_eq!(moments.mean(), Some(10.0));
        assert_eq!(moments.variance(), Some(4.0));
    }

    #[test]
    fn test_moments_need_two_values_for_variance() {
        let mut moments = Moments::default();
        assert_eq!(moments.mean(), None);
        moments.push(3.0);
        assert_eq!(moments.mean(), Some(3.0));
        assert_eq!(moments.variance(), None);
    }
}
