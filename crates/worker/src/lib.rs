//! Track-processing worker: queue wiring, the `track_processing` topic and
//! the admin HTTP surface.

pub mod app;
pub mod settings;
pub mod tracks;
