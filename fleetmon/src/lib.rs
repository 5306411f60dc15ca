//! Fleet telemetry poller.
//!
//! A set of independent poll loops keeps a shared last-known-good status
//! cache up to date, one loop per source. Sources are remote hosts reached
//! over multiplexed ssh, local shell probes, and in-process tasks such as
//! the GPU usage aggregator. The [`supervisor`] owns the loops and the
//! shutdown lifecycle; everything else reads the cache and never waits on
//! a poll.

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod poll;
pub mod probes;
pub mod supervisor;
pub mod utils;

pub use error::{Error, Result};
