//! Pure building blocks of goal synchronization: day-stamps, metrics and the
//! validated goal model.  Nothing in this crate performs I/O or reads a clock.

pub mod daystamp;
pub mod error;
pub mod goal;
pub mod metric;

pub use daystamp::{CutoffRegime, DayCutoff, DayRule, DayStamp, day_stamp, parse_timezone};
pub use error::ValidationError;
pub use goal::{DocumentRef, Goal, PollInterval, validate_unique_slugs};
pub use metric::{MetricKind, extract};
