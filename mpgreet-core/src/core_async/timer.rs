//! Tick-based one-shot scheduling

use super::errors::{AsyncError, AsyncResult};
use super::observable::Cancel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Schedules an action to run once after a number of ticks
///
/// Implementations must not run the action synchronously inside `schedule`.
pub trait Timer: Send + Sync {
    /// Run `action` after `ticks`; the returned handle prevents it if called
    /// before the action starts
    fn schedule(&self, ticks: u64, action: Box<dyn FnOnce() + Send + 'static>) -> Cancel;
}

/// [`Timer`] backed by the tokio runtime, one tick = `tick`
///
/// The runtime is captured when the timer is built, so actions can be
/// scheduled from any thread afterwards.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: Handle,
    tick: Duration,
}

impl TokioTimer {
    /// Timer on the current tokio runtime
    ///
    /// # Errors
    ///
    /// Returns [`AsyncError::NoRuntime`] when called outside a runtime.
    pub fn new(tick: Duration) -> AsyncResult<Self> {
        let handle = Handle::try_current().map_err(|e| AsyncError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(handle, tick))
    }

    pub fn with_handle(handle: Handle, tick: Duration) -> Self {
        Self { handle, tick }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, ticks: u64, action: Box<dyn FnOnce() + Send + 'static>) -> Cancel {
        let delay = u32::try_from(ticks)
            .ok()
            .and_then(|t| self.tick.checked_mul(t))
            .unwrap_or(Duration::MAX);

        // set once the action has started or the timer was cancelled
        let settled = Arc::new(AtomicBool::new(false));
        let settled_task = Arc::clone(&settled);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !settled_task.swap(true, Ordering::SeqCst) {
                action();
            }
        });

        Cancel::new(move || {
            if settled.swap(true, Ordering::SeqCst) {
                false
            } else {
                task.abort();
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_ticks() {
        let timer = TokioTimer::new(Duration::from_millis(10)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cancel = timer.schedule(3, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!cancel.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_firing() {
        let timer = TokioTimer::new(Duration::from_millis(1)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let cancel = timer.schedule(5, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(cancel.cancel());
        assert!(!cancel.cancel());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            TokioTimer::new(Duration::from_millis(1)),
            Err(AsyncError::NoRuntime(_))
        ));
    }

    #[test]
    fn test_with_handle_schedules_from_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let timer = TokioTimer::with_handle(runtime.handle().clone(), Duration::from_millis(1));
        let (tx, rx) = std::sync::mpsc::channel();
        timer.schedule(2, Box::new(move || tx.send(()).unwrap()));

        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(20)).await });
        assert!(rx.try_recv().is_ok());
    }
}
