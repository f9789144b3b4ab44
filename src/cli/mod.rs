//! CLI-specific utilities for itinerary-routing
//!
//! Code used only by the command-line binary, kept apart from the engine.

pub mod progress;

pub use progress::DayProgress;
