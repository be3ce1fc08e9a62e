//! Synchronous publish/subscribe with in-round cancellation

use super::failure::SubscriberFailure;
use super::timer::Timer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Handle that undoes a subscription or a scheduled action
///
/// `cancel` returns `true` only if this call actually cancelled something.
#[derive(Clone)]
pub struct Cancel(Arc<dyn Fn() -> bool + Send + Sync>);

impl Cancel {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn cancel(&self) -> bool {
        (self.0)()
    }
}

impl std::fmt::Debug for Cancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cancel")
    }
}

/// Cancel every handle; returns whether any of them cancelled something
pub fn combined_cancel(cancels: Vec<Cancel>) -> Cancel {
    Cancel::new(move || {
        cancels
            .iter()
            .fold(false, |cancelled, c| c.cancel() | cancelled)
    })
}

struct Subscriber<T> {
    id: u64,
    once: bool,
    callback: Callback<T>,
}

struct Inner<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    // callbacks never run under this lock, so a poisoned guard still holds
    // a consistent subscriber list
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An ordered set of subscribers that receive every published item
///
/// A publish round runs over the subscribers registered when it started, in
/// registration order. Cancelling a subscriber during the round skips it if
/// it has not run yet; subscribers added during the round only see later
/// rounds. A subscriber returning an error does not stop the round; the
/// error is reported to [`SubscriberFailure`] once the round is over.
pub struct Observable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Observable<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { next_id: 0, subscribers: Vec::new() })),
        }
    }

    /// Register a subscriber for every future publish
    pub fn subscribe<F>(&self, callback: F) -> Cancel
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(false, Arc::new(callback))
    }

    /// Register a subscriber that is removed right before its first call
    pub fn subscribe_once<F>(&self, callback: F) -> Cancel
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(true, Arc::new(callback))
    }

    /// Subscribe, racing the first publish against a timeout
    ///
    /// If nothing is published within `ticks` of `timer`, `backup` runs.
    /// Without `allow_fire_later` the subscription is dropped at that point;
    /// with it, `callback` stays subscribed and may still be called.
    pub fn subscribe_with_backup<F, B>(
        &self,
        timer: &dyn Timer,
        ticks: u64,
        backup: B,
        allow_fire_later: bool,
        callback: F,
    ) -> Cancel
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
        B: FnOnce() + Send + 'static,
    {
        let called = Arc::new(AtomicBool::new(false));
        let called_flag = Arc::clone(&called);
        let timeout_slot: Arc<Mutex<Option<Cancel>>> = Arc::new(Mutex::new(None));
        let timeout_for_callback = Arc::clone(&timeout_slot);

        let subscription = self.subscribe(move |item| {
            if !called_flag.swap(true, Ordering::SeqCst) {
                let pending = timeout_for_callback
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(timeout) = pending {
                    timeout.cancel();
                }
            }
            callback(item)
        });

        let on_timeout = subscription.clone();
        let timeout = timer.schedule(
            ticks,
            Box::new(move || {
                if !allow_fire_later {
                    on_timeout.cancel();
                }
                backup();
            }),
        );
        if called.load(Ordering::SeqCst) {
            timeout.cancel();
        } else {
            *timeout_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(timeout.clone());
        }

        combined_cancel(vec![subscription, timeout])
    }

    fn add(&self, once: bool, callback: Callback<T>) -> Cancel {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subscribers.push(Subscriber { id, once, callback });
            id
        };

        let weak: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        Cancel::new(move || match weak.upgrade() {
            Some(inner) => {
                let mut inner = lock(&inner);
                let before = inner.subscribers.len();
                inner.subscribers.retain(|s| s.id != id);
                inner.subscribers.len() != before
            }
            None => false,
        })
    }

    /// Publish to every subscriber, reporting failures afterwards
    ///
    /// Returns the number of subscribers that were called.
    pub fn publish(&self, item: &T) -> usize {
        let (called, failures) = self.dispatch(item);
        for error in failures {
            SubscriberFailure::report(error);
        }
        called
    }

    /// Run one publish round and hand back the subscribers' errors
    pub(super) fn dispatch(&self, item: &T) -> (usize, Vec<anyhow::Error>) {
        let snapshot: Vec<(u64, Callback<T>)> = lock(&self.inner)
            .subscribers
            .iter()
            .map(|s| (s.id, Arc::clone(&s.callback)))
            .collect();

        let mut called = 0;
        let mut failures = Vec::new();
        for (id, callback) in snapshot {
            {
                let mut inner = lock(&self.inner);
                let Some(pos) = inner.subscribers.iter().position(|s| s.id == id) else {
                    // cancelled earlier in this round
                    continue;
                };
                if inner.subscribers[pos].once {
                    inner.subscribers.remove(pos);
                }
            }
            called += 1;
            if let Err(error) = callback(item) {
                failures.push(error);
            }
        }
        (called, failures)
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_async::TokioTimer;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn drain(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    fn logger(log: &Log, name: &'static str) -> impl Fn(&u32) -> anyhow::Result<()> + Send + Sync {
        let log = log.clone();
        move |i| {
            push(&log, format!("called {}: {}", name, i));
            Ok(())
        }
    }

    /// Subscriber that cancels `target` and subscribes a failing `y`
    fn canceller(
        obs: &Observable<u32>,
        log: &Log,
        target: Arc<Mutex<Option<Cancel>>>,
        marker: &'static str,
    ) -> impl Fn(&u32) -> anyhow::Result<()> + Send + Sync {
        let obs = obs.clone();
        let log = log.clone();
        move |i| {
            if let Some(cancel) = target.lock().unwrap().as_ref() {
                cancel.cancel();
            }
            let fail_log = log.clone();
            obs.subscribe(move |i| {
                push(&fail_log, format!("called y: {}", i));
                Err(anyhow::anyhow!("help y {}", marker))
            });
            push(&log, format!("called z: {}", i));
            Ok(())
        }
    }

    fn failures_matching(marker: &'static str) -> (Cancel, Arc<Mutex<usize>>) {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let cancel = SubscriberFailure::subscribe_global(move |failure| {
            if failure.to_string().contains(marker) {
                *counter.lock().unwrap() += 1;
            }
            Ok(())
        });
        (cancel, count)
    }

    #[test]
    fn test_cancel_later_subscriber() {
        let marker = "cancel-later";
        let (unsubscribe, failures) = failures_matching(marker);
        let log = new_log();
        let obs = Observable::new();
        let target = Arc::new(Mutex::new(None));

        obs.subscribe(logger(&log, "x"));
        obs.subscribe(canceller(&obs, &log, target.clone(), marker));
        *target.lock().unwrap() = Some(obs.subscribe(logger(&log, "x")));

        obs.publish(&1);
        assert_eq!(drain(&log), vec!["called x: 1", "called z: 1"]);
        assert_eq!(*failures.lock().unwrap(), 0);

        obs.publish(&2);
        assert_eq!(drain(&log), vec!["called x: 2", "called z: 2", "called y: 2"]);
        assert_eq!(*failures.lock().unwrap(), 1);
        unsubscribe.cancel();
    }

    #[test]
    fn test_cancel_earlier_subscriber() {
        let marker = "cancel-earlier";
        let (unsubscribe, failures) = failures_matching(marker);
        let log = new_log();
        let obs = Observable::new();
        let target = Arc::new(Mutex::new(None));

        *target.lock().unwrap() = Some(obs.subscribe(logger(&log, "x")));
        obs.subscribe(canceller(&obs, &log, target.clone(), marker));
        obs.subscribe(logger(&log, "x"));

        obs.publish(&1);
        assert_eq!(drain(&log), vec!["called x: 1", "called z: 1", "called x: 1"]);

        obs.publish(&2);
        assert_eq!(drain(&log), vec!["called z: 2", "called x: 2", "called y: 2"]);
        assert_eq!(*failures.lock().unwrap(), 1);
        unsubscribe.cancel();
    }

    #[test]
    fn test_subscribe_once() {
        let log = new_log();
        let obs = Observable::new();
        obs.subscribe(logger(&log, "x"));
        obs.subscribe(logger(&log, "y"));
        obs.subscribe_once(logger(&log, "x"));
        obs.subscribe(logger(&log, "y"));
        obs.subscribe(logger(&log, "x"));

        assert_eq!(obs.publish(&1), 5);
        assert_eq!(
            drain(&log),
            vec!["called x: 1", "called y: 1", "called x: 1", "called y: 1", "called x: 1"]
        );

        assert_eq!(obs.publish(&2), 4);
        assert_eq!(
            drain(&log),
            vec!["called x: 2", "called y: 2", "called y: 2", "called x: 2"]
        );
    }

    #[test]
    fn test_cancel_multiple() {
        let log = new_log();
        let obs = Observable::new();
        let cancels = vec![
            obs.subscribe(logger(&log, "x")),
            obs.subscribe(logger(&log, "y")),
            obs.subscribe_once(logger(&log, "x")),
            obs.subscribe(logger(&log, "y")),
            obs.subscribe(logger(&log, "x")),
        ];

        obs.publish(&1);
        assert_eq!(drain(&log).len(), 5);

        let cancel_all = combined_cancel(cancels);
        assert!(cancel_all.cancel());
        obs.publish(&2);
        obs.publish(&3);
        assert!(drain(&log).is_empty());
        assert!(!cancel_all.cancel());
        assert!(obs.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backup_times_out() {
        let log = new_log();
        let obs: Observable<u32> = Observable::new();
        let timer = TokioTimer::new(Duration::from_millis(10)).unwrap();

        let backup_log = log.clone();
        let cb_log = log.clone();
        let cancel = obs.subscribe_with_backup(
            &timer,
            1,
            move || push(&backup_log, "timeout x"),
            false,
            move |_| {
                push(&cb_log, "called x");
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(drain(&log), vec!["timeout x"]);
        obs.publish(&1);
        assert!(!cancel.cancel());
        assert!(drain(&log).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backup_allow_fire_later() {
        let log = new_log();
        let obs: Observable<u32> = Observable::new();
        let timer = TokioTimer::new(Duration::from_millis(10)).unwrap();

        let backup_log = log.clone();
        let cb_log = log.clone();
        let cancel = obs.subscribe_with_backup(
            &timer,
            1,
            move || push(&backup_log, "timeout x"),
            true,
            move |_| {
                push(&cb_log, "called x");
                Ok(())
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        obs.publish(&1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(drain(&log), vec!["timeout x", "called x"]);
        assert!(cancel.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_backup_published_in_time() {
        let log = new_log();
        let obs: Observable<u32> = Observable::new();
        let timer = TokioTimer::new(Duration::from_millis(10)).unwrap();

        let backup_log = log.clone();
        let cb_log = log.clone();
        let _cancel = obs.subscribe_with_backup(
            &timer,
            5,
            move || push(&backup_log, "timeout x"),
            false,
            move |_| {
                push(&cb_log, "called x");
                Ok(())
            },
        );

        obs.publish(&1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(drain(&log), vec!["called x"]);
    }
}
