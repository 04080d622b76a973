//! Email queue module: claims queued rows and drives them to `sent` or `error`.

mod processor;

pub use processor::*;
