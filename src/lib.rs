//! orchestra-relay library root.
//!
//! Agents exchange XML envelopes through the relay: each envelope is checked
//! for structure and business rules, queued by priority, retried under its
//! policy and recorded in a searchable store and a tamper-evident audit log.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod routing;
pub mod validation;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use protocol::{Envelope, EnvelopeBuilder};
pub use relay::{Relay, RelayOptions, SubmitOutcome};
pub use validation::EnvelopeValidator;
