//! Stream combinators for host-facing update streams

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
