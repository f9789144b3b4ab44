//! Progress display for day recalculation
//!
//! One bar tick per finished day, with the day currently being routed as
//! the bar message.

use indicatif::{ProgressBar, ProgressStyle};
use itinerary_routing::{DayRouting, ProgressCallback};
use std::sync::Arc;

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} days {msg}";

/// Creates a day-count progress bar for CLI display
pub fn create_progress_bar(total_days: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_days);
    let style = ProgressStyle::default_bar()
        .template(TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Progress bar fed by the orchestrator's callback and day snapshots
#[derive(Clone)]
pub struct DayProgress {
    pub pb: ProgressBar,
}

impl DayProgress {
    pub fn new(total_days: u64, message: &str) -> Self {
        eprintln!("{message}");
        Self {
            pb: create_progress_bar(total_days),
        }
    }

    /// Callback advancing the bar as days finish.
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |done: u64, total: u64| {
            if pb.length() != Some(total) {
                pb.set_length(total);
            }
            pb.set_position(done);
            if done >= total {
                pb.finish_with_message("done");
            }
        })
    }

    /// Show which leg of which day is being routed.
    pub fn observe(&self, routing: &DayRouting) {
        if routing.is_calculating {
            self.pb
                .set_message(format!(
                    "{}: {} leg(s) routed",
                    routing.day_key,
                    routing.segments.len()
                ));
        }
    }
}
