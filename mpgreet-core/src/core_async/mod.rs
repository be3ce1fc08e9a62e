//! Event notification and scheduling primitives
//!
//! - [`Observable`]: ordered synchronous publish/subscribe with cancellation
//!   that takes effect within a publish round
//! - [`SubscriberFailure`]: process-wide channel receiving errors raised by
//!   subscribers
//! - [`Timer`] / [`TokioTimer`]: tick-based one-shot scheduling
//! - [`Monitor`]: repeatedly runs an action on a schedule until it reports
//!   completion

mod errors;
mod failure;
mod monitor;
mod observable;
mod timer;

pub use errors::{AsyncError, AsyncResult};
pub use failure::SubscriberFailure;
pub use monitor::{Intervals, Monitor, MonitorState};
pub use observable::{combined_cancel, Cancel, Observable};
pub use timer::{Timer, TokioTimer};
