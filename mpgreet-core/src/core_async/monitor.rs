//! Repeatedly run an action on a schedule until it reports completion

use super::errors::{AsyncError, AsyncResult};
use super::failure::SubscriberFailure;
use super::observable::Cancel;
use super::timer::Timer;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

type Action = Box<dyn FnMut() -> anyhow::Result<bool> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Paused,
    Stopped,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Running => "RUNNING",
            MonitorState::Paused => "PAUSED",
            MonitorState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delays between runs, in timer ticks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intervals {
    /// Same delay forever
    Fixed(u64),
    /// One run per entry; the monitor stops once the sequence is used up
    Sequence(VecDeque<u64>),
}

impl Intervals {
    pub fn sequence<I: IntoIterator<Item = u64>>(ticks: I) -> Self {
        Intervals::Sequence(ticks.into_iter().collect())
    }

    fn next_delay(&mut self) -> Option<u64> {
        match self {
            Intervals::Fixed(ticks) => Some(*ticks),
            Intervals::Sequence(ticks) => ticks.pop_front(),
        }
    }
}

struct Control {
    state: MonitorState,
    intervals: Intervals,
    pending: Option<Cancel>,
    // bumped whenever the pending run is replaced so stale timers do nothing
    generation: u64,
}

struct MonitorInner {
    timer: Arc<dyn Timer>,
    control: Mutex<Control>,
    action: Mutex<Action>,
}

impl MonitorInner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs an action after each interval while RUNNING
///
/// The action returns `Ok(true)` when it is done, which stops the monitor.
/// An error also stops it and is reported through [`SubscriberFailure`].
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Create a monitor and schedule its first run
    pub fn new<F>(timer: Arc<dyn Timer>, intervals: Intervals, action: F) -> Self
    where
        F: FnMut() -> anyhow::Result<bool> + Send + 'static,
    {
        let inner = Arc::new(MonitorInner {
            timer,
            control: Mutex::new(Control {
                state: MonitorState::Running,
                intervals,
                pending: None,
                generation: 0,
            }),
            action: Mutex::new(Box::new(action)),
        });
        {
            let mut control = inner.control();
            arm(&inner, &mut control);
        }
        Self { inner }
    }

    pub fn state(&self) -> MonitorState {
        self.inner.control().state
    }

    /// Suspend scheduled runs
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::InvalidState`] unless the monitor is RUNNING.
    pub fn pause(&self) -> AsyncResult<()> {
        let mut control = self.inner.control();
        if control.state != MonitorState::Running {
            return Err(AsyncError::InvalidState {
                operation: "pause",
                state: control.state.as_str(),
            });
        }
        disarm(&mut control);
        control.state = MonitorState::Paused;
        Ok(())
    }

    /// Continue after [`Monitor::pause`], starting a fresh interval
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::InvalidState`] unless the monitor is PAUSED.
    pub fn resume(&self) -> AsyncResult<()> {
        let mut control = self.inner.control();
        if control.state != MonitorState::Paused {
            return Err(AsyncError::InvalidState {
                operation: "resume",
                state: control.state.as_str(),
            });
        }
        control.state = MonitorState::Running;
        arm(&self.inner, &mut control);
        Ok(())
    }

    pub fn stop(&self) {
        let mut control = self.inner.control();
        disarm(&mut control);
        control.state = MonitorState::Stopped;
    }

    /// Replace the schedule and run again from any state
    pub fn reset(&self, intervals: Intervals) {
        let mut control = self.inner.control();
        disarm(&mut control);
        control.intervals = intervals;
        control.state = MonitorState::Running;
        arm(&self.inner, &mut control);
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("state", &self.state()).finish()
    }
}

fn disarm(control: &mut Control) {
    control.generation += 1;
    if let Some(pending) = control.pending.take() {
        pending.cancel();
    }
}

fn arm(inner: &Arc<MonitorInner>, control: &mut Control) {
    let Some(ticks) = control.intervals.next_delay() else {
        debug!("Monitor schedule exhausted");
        control.state = MonitorState::Stopped;
        return;
    };
    control.generation += 1;
    let generation = control.generation;
    let weak: Weak<MonitorInner> = Arc::downgrade(inner);
    control.pending = Some(inner.timer.schedule(
        ticks,
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                run(&inner, generation);
            }
        }),
    ));
}

fn run(inner: &Arc<MonitorInner>, generation: u64) {
    {
        let mut control = inner.control();
        if control.state != MonitorState::Running || control.generation != generation {
            return;
        }
        control.pending = None;
    }

    let result = {
        let mut action = inner.action.lock().unwrap_or_else(PoisonError::into_inner);
        action()
    };

    let mut control = inner.control();
    if control.state != MonitorState::Running || control.generation != generation {
        // paused, stopped or reset while the action ran
        return;
    }
    match result {
        Ok(false) => arm(inner, &mut control),
        Ok(true) => control.state = MonitorState::Stopped,
        Err(error) => {
            control.state = MonitorState::Stopped;
            drop(control);
            SubscriberFailure::report(error);
        }
    }
}
