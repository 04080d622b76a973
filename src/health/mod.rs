//! Health state tracking.

mod tracker;

pub use tracker::*;
