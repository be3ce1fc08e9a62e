//! Process-wide channel for errors raised by subscribers

use super::observable::{Cancel, Observable};
use crate::metrics::{self as greet_metrics, names};
use std::fmt;
use std::sync::OnceLock;
use tracing::error;

static GLOBAL: OnceLock<Observable<SubscriberFailure>> = OnceLock::new();

/// An error a subscriber returned while handling a published item
#[derive(Debug)]
pub struct SubscriberFailure {
    pub error: anyhow::Error,
}

impl fmt::Display for SubscriberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber failed: {:#}", self.error)
    }
}

impl SubscriberFailure {
    fn global() -> &'static Observable<SubscriberFailure> {
        GLOBAL.get_or_init(Observable::new)
    }

    /// Listen for subscriber failures raised anywhere in the process
    pub fn subscribe_global<F>(callback: F) -> Cancel
    where
        F: Fn(&SubscriberFailure) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::global().subscribe(callback)
    }

    /// Log a failure and hand it to the global subscribers
    ///
    /// Errors raised by the global subscribers themselves are only logged.
    pub fn report(error: anyhow::Error) {
        error!("Subscriber failed: {:#}", error);
        greet_metrics::record_counter(names::SUBSCRIBER_FAILURES, 1);

        let failure = SubscriberFailure { error };
        let (_, nested) = Self::global().dispatch(&failure);
        for e in nested {
            error!("Failure handler failed while handling {}: {:#}", failure, e);
        }
    }
}
