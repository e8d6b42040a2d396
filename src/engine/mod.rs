//! Background work that talks to the backend on its own schedule.

mod log_tail;
mod shutdown;

pub use log_tail::{classify, leading_timestamp, LogMonitor, PollerEvent};
#[cfg(test)]
pub use log_tail::LogTail;
pub use shutdown::{run_shutdown_sequence, ShutdownPolicy};
