//! Application-level orchestration.
//!
//! [`Orchestrator`] owns application state and the step table and is the only thing that
//! writes them. The controller wraps it in a command loop for the interactive UI; the
//! one-shot CLI runners drive it directly through [`perform`].

mod controller;
mod reconcile;
mod state;

pub(crate) use controller::{perform, run_controller, Command, ControllerExit};
pub use state::{Activity, Orchestrator, Settlement, Snapshot};
