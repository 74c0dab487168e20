//! A synchronization agent for split (feature flag) and segment definitions.
//!
//! # Overview
//!
//! The agent keeps a cache of splits and segments current by polling the central service for
//! changes since the last applied version, and relays impressions and metrics buffered by SDKs
//! back to the central service.
//!
//! It runs in one of two [`Mode`]s:
//! - [`Mode::Producer`] writes into a shared Redis store that SDKs read from, and drains the
//!   impressions and metrics SDKs buffer there.
//! - [`Mode::Proxy`] keeps an embedded [`LocalStorage`] in sync for an SDK-facing HTTP layer
//!   running in the same process.
//!
//! Every piece of work is a named task on the [`Scheduler`]: one for splits, one per referenced
//! segment (started and stopped as splits change), one per impressions recorder thread, one for
//! metrics and one for the optional impression listener. Tasks are isolated from each other: a
//! failing or slow task never delays or stops another one.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Inside tasks, errors are logged and the task
//! retries on its next tick; they are never fatal to the agent.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! the `split_sync` target. The `split-sync` binary installs `env_logger`.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod agent;
pub mod config;
pub mod dtos;
mod error;
pub mod fetcher;
pub mod http;
pub mod listener;
pub mod recorder;
pub mod scheduler;
pub mod storage;
pub mod synchronizer;

#[cfg(test)]
mod testing;

pub use agent::{Agent, Collaborators, Mode};
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use scheduler::{Scheduler, TaskStats};
pub use storage::{local::LocalStorage, redis::RedisStorage, ApplyOutcome, Storage};
