// dockhand-common: shared infrastructure for the dockhand runner.
// Executor combinators, secret masking, and job-scoped logging.

pub mod executor;
pub mod logging;
pub mod masker;

pub use executor::{is_cancelled, Cancelled, Executor, TimedOut};
pub use logging::JobLogger;
pub use masker::Masks;
