//! # vs-model — The "Vocabulary" of VESPER
//!
//! Pure data: the indicator schema, the should-clause builder, the two
//! query builders, and the interval grammar. No I/O lives here; the
//! crates above compose these into scans.

pub mod indicator;
pub mod interval;
pub mod queries;

pub use indicator::{Detection, Indicator, Observable, EVENT_FIELDS};
pub use interval::Interval;
