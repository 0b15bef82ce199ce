//! Rate throttling logic and state management.

mod gate;
mod limit;
mod throttler;

pub use gate::PermissionGate;
pub use limit::{ThrottleLimit, TimeUnit, MAX_COUNT_LIMIT};
pub use throttler::{Admission, RateThrottler};
