//! `trailbeacon` - durable, at-least-once location reporting
//!
//! Location samples are captured on a fixed cadence, persisted in a durable
//! queue and delivered to a remote collector one at a time with exponential
//! backoff. When delivery keeps failing, an emergency contact is texted the
//! last known coordinates.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod sample;
pub mod source;
pub mod storage;
pub mod transmit;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use controller::{BackoffPolicy, ControllerState, FailureStreak, RetryController};
pub use error::{Error, Result};
pub use identity::{DeviceIdentity, EmergencyContact};
pub use logging::init_logging;
pub use notify::{FallbackNotifier, NotifyError, SentStatus, SmsChannel};
pub use pipeline::{Pipeline, PipelineEvent, PipelineHandle, PipelineParts, PipelineStatus};
pub use queue::{DurableQueue, QueueEntry};
pub use sample::{LocationSample, Position};
pub use source::{AcquisitionError, PositionProvider, SampleSource};
pub use storage::{Storage, StorageStats};
pub use transmit::{Ack, Transmit, TransmitError, TransmitErrorKind};
