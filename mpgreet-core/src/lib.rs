//! Authenticated group key agreement for multi-party chat
//!
//! A [`Greeter`] turns membership changes into signed greeting packets and
//! drives a [`Greeting`] per operation until every member holds the same
//! group key. Supporting modules:
//! - [`core_graph`]: causal ordering and 3-way merges over a message DAG
//! - [`core_async`]: ordered publish/subscribe, timers and monitors
//! - [`core_codec`] / [`core_crypto`]: wire records and primitives

pub mod config;
pub mod core_async;
pub mod core_codec;
pub mod core_crypto;
pub mod core_graph;
pub mod core_greet;
pub mod logging;
pub mod metrics;

pub use config::Config;
pub use core_greet::{Greeter, Greeting, GreetError, GreetResult, GreetStore, GreetingState};
pub use logging::{init_logging, LogLevel};
