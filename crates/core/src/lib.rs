//! `trackflow-core`: shared building blocks for the trackflow workspace.
//!
//! This crate contains **pure** primitives (identifiers, time, domain errors);
//! no storage or transport concerns live here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{MessageId, TrackId};
